// DNS wire format primitives
//
// Just enough of RFC 1035 / RFC 6891 for the tunnel:
// - 12-byte header with the flag bits the codec cares about
// - names with compression pointers on read (never emitted except for the answer owner)
// - questions, resource records and TXT character-strings
// - the fixed EDNS0 OPT pseudo-record

use super::{
    DnsError, Result, CLASS_IN, EDNS_UDP_PAYLOAD, MAX_DNS_LABEL_LEN, MAX_DNS_NAME_LEN, RR_OPT,
};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;

pub const FLAG_QR: u16 = 0x8000;
pub const FLAG_AA: u16 = 0x0400;
pub const FLAG_RD: u16 = 0x0100;
pub const FLAG_CD: u16 = 0x0010;
const RCODE_MASK: u16 = 0x000f;

/// Compression pointers followed before a name is rejected
const MAX_POINTER_DEPTH: usize = 16;

/// TXT character-string limit
const TXT_CHUNK_LEN: usize = 255;

/// Response codes used by the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rcode {
    Ok,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
}

impl Rcode {
    pub fn to_u8(self) -> u8 {
        match self {
            Rcode::Ok => 0,
            Rcode::FormatError => 1,
            Rcode::ServerFailure => 2,
            Rcode::NameError => 3,
            Rcode::NotImplemented => 4,
            Rcode::Refused => 5,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Rcode::Ok),
            1 => Some(Rcode::FormatError),
            2 => Some(Rcode::ServerFailure),
            3 => Some(Rcode::NameError),
            4 => Some(Rcode::NotImplemented),
            5 => Some(Rcode::Refused),
            _ => None,
        }
    }
}

impl std::fmt::Display for Rcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Rcode::Ok => "NOERROR",
            Rcode::FormatError => "FORMERR",
            Rcode::ServerFailure => "SERVFAIL",
            Rcode::NameError => "NXDOMAIN",
            Rcode::NotImplemented => "NOTIMP",
            Rcode::Refused => "REFUSED",
        };
        f.write_str(name)
    }
}

/// DNS message header (12 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    pub const LEN: usize = 12;

    /// Parse header from bytes
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if buf.remaining() < Self::LEN {
            return Err(DnsError::InvalidMessage("Header too short".into()));
        }

        Ok(Self {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    /// Write header to buffer
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RD != 0
    }

    pub fn checking_disabled(&self) -> bool {
        self.flags & FLAG_CD != 0
    }

    /// `None` for rcodes the tunnel never produces
    pub fn rcode(&self) -> Option<Rcode> {
        Rcode::from_u8((self.flags & RCODE_MASK) as u8)
    }
}

/// DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Fully qualified, with trailing dot
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_name(buf)?;

        if buf.remaining() < 4 {
            return Err(DnsError::InvalidMessage("Question too short".into()));
        }

        Ok(Self {
            name,
            qtype: buf.get_u16(),
            qclass: buf.get_u16(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_name(&self.name, buf)?;
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
        Ok(())
    }
}

/// DNS resource record
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_name(buf)?;

        if buf.remaining() < 10 {
            return Err(DnsError::InvalidMessage("Record too short".into()));
        }

        let rtype = buf.get_u16();
        let rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;

        if buf.remaining() < rdlen {
            return Err(DnsError::InvalidMessage("Truncated record data".into()));
        }

        let mut rdata = vec![0u8; rdlen];
        buf.copy_to_slice(&mut rdata);

        Ok(Self {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }
}

/// Read a possibly compressed name, leaving the cursor after its in-place encoding
pub fn read_name(buf: &mut Cursor<&[u8]>) -> Result<String> {
    let packet: &[u8] = *buf.get_ref();
    let mut offset = buf.position() as usize;
    let mut resume_at: Option<usize> = None;
    let mut visited: Vec<usize> = Vec::new();
    let mut labels: Vec<&str> = Vec::new();
    let mut name_len = 0usize;

    loop {
        let len = *packet
            .get(offset)
            .ok_or_else(|| DnsError::InvalidMessage("Name out of range".into()))?;

        if len & 0xC0 == 0xC0 {
            let low = *packet
                .get(offset + 1)
                .ok_or_else(|| DnsError::InvalidMessage("Truncated pointer".into()))?;
            let target = (((len & 0x3F) as usize) << 8) | low as usize;
            if target >= packet.len() {
                return Err(DnsError::InvalidMessage("Pointer out of range".into()));
            }
            if visited.contains(&target) {
                return Err(DnsError::InvalidMessage("Pointer loop".into()));
            }
            if visited.len() == MAX_POINTER_DEPTH {
                return Err(DnsError::InvalidMessage("Pointer depth exceeded".into()));
            }
            visited.push(target);
            resume_at.get_or_insert(offset + 2);
            offset = target;
            continue;
        }

        if len == 0 {
            offset += 1;
            break;
        }

        let len = len as usize;
        if len > MAX_DNS_LABEL_LEN {
            return Err(DnsError::InvalidMessage("Label too long".into()));
        }
        let start = offset + 1;
        let end = start + len;
        if end > packet.len() {
            return Err(DnsError::InvalidMessage("Label out of range".into()));
        }
        if !labels.is_empty() {
            name_len += 1;
        }
        name_len += len;
        if name_len > MAX_DNS_NAME_LEN {
            return Err(DnsError::InvalidMessage("Name too long".into()));
        }
        let label = std::str::from_utf8(&packet[start..end])
            .map_err(|_| DnsError::InvalidMessage("Label not UTF-8".into()))?;
        labels.push(label);
        offset = end;
    }

    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        let mut name = labels.join(".");
        name.push('.');
        name
    };

    buf.set_position(resume_at.unwrap_or(offset) as u64);
    Ok(name)
}

/// Write a name without compression
pub fn write_name(name: &str, buf: &mut BytesMut) -> Result<()> {
    if name == "." {
        buf.put_u8(0);
        return Ok(());
    }

    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let mut name_len = 0usize;
    for (index, label) in trimmed.split('.').enumerate() {
        if label.is_empty() {
            return Err(DnsError::EncodingError("Empty label".into()));
        }
        if label.len() > MAX_DNS_LABEL_LEN {
            return Err(DnsError::EncodingError(format!(
                "Label too long: {} bytes",
                label.len()
            )));
        }
        if index > 0 {
            name_len += 1;
        }
        name_len += label.len();
        if name_len > MAX_DNS_NAME_LEN {
            return Err(DnsError::EncodingError(format!(
                "Name too long: {} bytes",
                name_len
            )));
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

/// Length of TXT rdata carrying `payload_len` raw bytes
pub fn txt_rdata_len(payload_len: usize) -> usize {
    payload_len + payload_len.div_ceil(TXT_CHUNK_LEN)
}

/// Split raw bytes into length-prefixed character-strings
pub fn write_txt_rdata(payload: &[u8], buf: &mut BytesMut) {
    for chunk in payload.chunks(TXT_CHUNK_LEN) {
        buf.put_u8(chunk.len() as u8);
        buf.put_slice(chunk);
    }
}

/// Concatenate TXT character-strings; `None` when a string overruns the rdata
pub fn read_txt_rdata(rdata: &[u8]) -> Option<Vec<u8>> {
    let mut cursor = Cursor::new(rdata);
    let mut out = Vec::with_capacity(rdata.len());

    while cursor.has_remaining() {
        let len = cursor.get_u8() as usize;
        if cursor.remaining() < len {
            return None;
        }
        let start = cursor.position() as usize;
        out.extend_from_slice(&rdata[start..start + len]);
        cursor.advance(len);
    }

    Some(out)
}

/// EDNS0 OPT pseudo-record: root owner, no options
pub fn write_opt_record(buf: &mut BytesMut) {
    buf.put_u8(0);
    buf.put_u16(RR_OPT);
    buf.put_u16(EDNS_UDP_PAYLOAD);
    buf.put_u32(0);
    buf.put_u16(0);
}

/// Question for the IN class
pub fn in_question(name: impl Into<String>, qtype: u16) -> Question {
    Question {
        name: name.into(),
        qtype,
        qclass: CLASS_IN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::RR_TXT;

    fn name_with_last_label(last: usize) -> String {
        format!(
            "{}.{}.{}.{}.",
            "a".repeat(63),
            "b".repeat(63),
            "c".repeat(63),
            "d".repeat(last)
        )
    }

    #[test]
    fn test_name_roundtrip() {
        let mut buf = BytesMut::new();
        write_name("tunnel.example.com.", &mut buf).unwrap();

        let mut cursor = Cursor::new(&buf[..]);
        assert_eq!(read_name(&mut cursor).unwrap(), "tunnel.example.com.");
        assert_eq!(cursor.position() as usize, buf.len());
    }

    #[test]
    fn test_root_name() {
        let mut buf = BytesMut::new();
        write_name(".", &mut buf).unwrap();
        assert_eq!(&buf[..], &[0]);

        let mut cursor = Cursor::new(&buf[..]);
        assert_eq!(read_name(&mut cursor).unwrap(), ".");
    }

    #[test]
    fn test_write_name_length_limit() {
        let mut buf = BytesMut::new();
        let longest = name_with_last_label(61);
        assert_eq!(longest.trim_end_matches('.').len(), MAX_DNS_NAME_LEN);
        assert!(write_name(&longest, &mut buf).is_ok());

        let mut buf = BytesMut::new();
        assert!(write_name(&name_with_last_label(62), &mut buf).is_err());
    }

    #[test]
    fn test_write_name_rejects_bad_labels() {
        let mut buf = BytesMut::new();
        assert!(write_name("a..b.", &mut buf).is_err());

        let mut buf = BytesMut::new();
        let long_label = format!("{}.com.", "x".repeat(64));
        assert!(write_name(&long_label, &mut buf).is_err());
    }

    #[test]
    fn test_read_name_length_limit() {
        let mut packet = Vec::new();
        for len in [63usize, 63, 63, 62] {
            packet.push(len as u8);
            packet.extend(std::iter::repeat(b'a').take(len));
        }
        packet.push(0);

        let mut cursor = Cursor::new(&packet[..]);
        assert!(read_name(&mut cursor).is_err());
    }

    #[test]
    fn test_compression_pointer() {
        // "example.com." at offset 0, then "www" + pointer to 0
        let mut packet = Vec::new();
        packet.extend_from_slice(&[7]);
        packet.extend_from_slice(b"example");
        packet.extend_from_slice(&[3]);
        packet.extend_from_slice(b"com");
        packet.push(0);
        let second = packet.len();
        packet.push(3);
        packet.extend_from_slice(b"www");
        packet.extend_from_slice(&[0xC0, 0x00]);
        packet.extend_from_slice(&[0xAB, 0xCD]);

        let mut cursor = Cursor::new(&packet[..]);
        cursor.set_position(second as u64);
        assert_eq!(read_name(&mut cursor).unwrap(), "www.example.com.");
        // Cursor lands right after the pointer, not after the target
        assert_eq!(cursor.get_u16(), 0xABCD);
    }

    #[test]
    fn test_pointer_loop_rejected() {
        let packet = [0xC0u8, 0x02, 0xC0, 0x00];
        let mut cursor = Cursor::new(&packet[..]);
        assert!(read_name(&mut cursor).is_err());
    }

    #[test]
    fn test_pointer_out_of_range() {
        let packet = [0xC0u8, 0x40];
        let mut cursor = Cursor::new(&packet[..]);
        assert!(read_name(&mut cursor).is_err());
    }

    #[test]
    fn test_txt_chunking() {
        let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let mut buf = BytesMut::new();
        write_txt_rdata(&payload, &mut buf);

        assert_eq!(buf.len(), txt_rdata_len(payload.len()));
        assert_eq!(buf[0], 255);
        assert_eq!(buf[256], 255);
        assert_eq!(buf[512], 90);
        assert_eq!(read_txt_rdata(&buf).unwrap(), payload);
    }

    #[test]
    fn test_txt_overrun() {
        assert!(read_txt_rdata(&[5, 1, 2]).is_none());
    }

    #[test]
    fn test_header_flags() {
        let header = DnsHeader {
            id: 7,
            flags: FLAG_QR | FLAG_RD | FLAG_CD | Rcode::NameError.to_u8() as u16,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 1,
        };
        let mut buf = BytesMut::new();
        header.write(&mut buf);

        let mut cursor = Cursor::new(&buf[..]);
        let parsed = DnsHeader::parse(&mut cursor).unwrap();
        assert!(parsed.is_response());
        assert!(parsed.recursion_desired());
        assert!(parsed.checking_disabled());
        assert_eq!(parsed.rcode(), Some(Rcode::NameError));
    }

    #[test]
    fn test_question_roundtrip() {
        let question = in_question("abc.t.example.", RR_TXT);
        let mut buf = BytesMut::new();
        question.write(&mut buf).unwrap();

        let mut cursor = Cursor::new(&buf[..]);
        assert_eq!(Question::parse(&mut cursor).unwrap(), question);
    }
}
