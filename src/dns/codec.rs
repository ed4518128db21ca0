// DNS codec for tunnel packets
//
// Upstream: QUIC packet -> QNAME of a TXT query (see qname.rs)
// Downstream: QUIC packet -> TXT answer, owner compressed onto the question
//
// decode_query never fails silently into data: every outcome is either a
// decoded payload, a reply carrying an rcode, or a drop.

use super::protocol::{
    read_name, read_txt_rdata, txt_rdata_len, write_opt_record, write_txt_rdata, DnsHeader,
    Question, Rcode, ResourceRecord, FLAG_AA, FLAG_CD, FLAG_QR, FLAG_RD,
};
use super::qname::{base32_decode, build_qname, undotify, DomainMatcher};
use super::{DnsError, Result, ANSWER_TTL, CLASS_IN, DNS_MAX_QUERY_SIZE, RR_TXT};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;

/// Raw query builder parameters
#[derive(Debug, Clone)]
pub struct QueryParams<'a> {
    pub id: u16,
    pub qname: &'a str,
    pub qtype: u16,
    pub qclass: u16,
    pub rd: bool,
    pub cd: bool,
    pub qdcount: u16,
    pub is_query: bool,
}

impl<'a> QueryParams<'a> {
    /// Standard recursive TXT query for `qname`
    pub fn txt(id: u16, qname: &'a str) -> Self {
        Self {
            id,
            qname,
            qtype: RR_TXT,
            qclass: CLASS_IN,
            rd: true,
            cd: false,
            qdcount: 1,
            is_query: true,
        }
    }
}

/// Response builder parameters
#[derive(Debug, Clone)]
pub struct ResponseParams<'a> {
    pub id: u16,
    pub rd: bool,
    pub cd: bool,
    /// Echoed question; omitted (QDCOUNT=0) when the query had none we could parse
    pub question: Option<&'a Question>,
    pub payload: Option<&'a [u8]>,
    /// Explicit rcode; otherwise OK with data, NAME_ERROR without
    pub rcode: Option<Rcode>,
}

/// A query that carried a tunnel payload
#[derive(Debug, Clone)]
pub struct DecodedQuery {
    pub id: u16,
    pub rd: bool,
    pub cd: bool,
    pub question: Question,
    pub payload: Vec<u8>,
}

impl DecodedQuery {
    /// Response parameters echoing this query
    pub fn response<'a>(
        &'a self,
        payload: Option<&'a [u8]>,
        rcode: Option<Rcode>,
    ) -> ResponseParams<'a> {
        ResponseParams {
            id: self.id,
            rd: self.rd,
            cd: self.cd,
            question: Some(&self.question),
            payload,
            rcode,
        }
    }
}

/// Why a query produced no payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeQueryError {
    /// Not worth answering
    Drop,
    /// Answer with `rcode` and no data
    Reply {
        id: u16,
        rd: bool,
        cd: bool,
        question: Option<Question>,
        rcode: Rcode,
    },
}

impl DecodeQueryError {
    /// Encoded error response, `None` for drops
    pub fn to_response(&self) -> Option<Vec<u8>> {
        match self {
            DecodeQueryError::Drop => None,
            DecodeQueryError::Reply {
                id,
                rd,
                cd,
                question,
                rcode,
            } => encode_response(&ResponseParams {
                id: *id,
                rd: *rd,
                cd: *cd,
                question: question.as_ref(),
                payload: None,
                rcode: Some(*rcode),
            })
            .ok(),
        }
    }
}

/// Encode a query message from raw parameters
pub fn encode_message(params: &QueryParams<'_>) -> Result<Vec<u8>> {
    let mut flags = 0u16;
    if !params.is_query {
        flags |= FLAG_QR;
    }
    if params.rd {
        flags |= FLAG_RD;
    }
    if params.cd {
        flags |= FLAG_CD;
    }

    let header = DnsHeader {
        id: params.id,
        flags,
        qdcount: params.qdcount,
        ancount: 0,
        nscount: 0,
        arcount: 1,
    };

    let mut buf = BytesMut::with_capacity(DNS_MAX_QUERY_SIZE);
    header.write(&mut buf);
    for _ in 0..params.qdcount {
        Question {
            name: params.qname.to_string(),
            qtype: params.qtype,
            qclass: params.qclass,
        }
        .write(&mut buf)?;
    }
    write_opt_record(&mut buf);

    Ok(buf.to_vec())
}

/// Encode `payload` as a TXT query under `domain`
///
/// An empty payload yields a query for the bare domain, which servers answer
/// with NAME_ERROR; polls always carry at least one packet byte.
pub fn encode_query(payload: &[u8], domain: &str, id: u16) -> Result<Vec<u8>> {
    let qname = build_qname(payload, domain)?;
    let packet = encode_message(&QueryParams::txt(id, &qname))?;
    if packet.len() > DNS_MAX_QUERY_SIZE {
        return Err(DnsError::PacketTooLarge(packet.len(), DNS_MAX_QUERY_SIZE));
    }
    Ok(packet)
}

/// Split `payload` into `segment_len` pieces, one query each, with consecutive ids
pub fn segment_queries(
    payload: &[u8],
    segment_len: usize,
    domain: &str,
    first_id: u16,
) -> Result<Vec<Vec<u8>>> {
    if segment_len == 0 || payload.len() % segment_len != 0 {
        return Err(DnsError::EncodingError(format!(
            "payload of {} bytes is not a multiple of segment length {}",
            payload.len(),
            segment_len
        )));
    }

    payload
        .chunks(segment_len)
        .enumerate()
        .map(|(i, segment)| encode_query(segment, domain, first_id.wrapping_add(i as u16)))
        .collect()
}

/// Encode a response to a tunnel query
pub fn encode_response(params: &ResponseParams<'_>) -> Result<Vec<u8>> {
    let payload = params.payload.unwrap_or(&[]);
    let rcode = params.rcode.unwrap_or(if payload.is_empty() {
        Rcode::NameError
    } else {
        Rcode::Ok
    });
    let with_answer = !payload.is_empty() && rcode == Rcode::Ok && params.question.is_some();

    let rdata_len = txt_rdata_len(payload.len());
    if with_answer && rdata_len > u16::MAX as usize {
        return Err(DnsError::PacketTooLarge(payload.len(), u16::MAX as usize));
    }

    let mut flags = FLAG_QR | FLAG_AA | rcode.to_u8() as u16;
    if params.rd {
        flags |= FLAG_RD;
    }
    if params.cd {
        flags |= FLAG_CD;
    }

    let header = DnsHeader {
        id: params.id,
        flags,
        qdcount: params.question.is_some() as u16,
        ancount: with_answer as u16,
        nscount: 0,
        arcount: 1,
    };

    let mut buf = BytesMut::with_capacity(DnsHeader::LEN + 64 + rdata_len);
    header.write(&mut buf);

    if let Some(question) = params.question {
        question.write(&mut buf)?;

        if with_answer {
            // Owner name points at the question name right after the header
            buf.put_u16(0xC000 | DnsHeader::LEN as u16);
            buf.put_u16(question.qtype);
            buf.put_u16(question.qclass);
            buf.put_u32(ANSWER_TTL);
            buf.put_u16(rdata_len as u16);
            write_txt_rdata(payload, &mut buf);
        }
    }

    write_opt_record(&mut buf);

    Ok(buf.to_vec())
}

fn reply(header: &DnsHeader, question: Option<Question>, rcode: Rcode) -> DecodeQueryError {
    DecodeQueryError::Reply {
        id: header.id,
        rd: header.recursion_desired(),
        cd: header.checking_disabled(),
        question,
        rcode,
    }
}

/// Decode a tunnel query against the configured domains
pub fn decode_query(
    packet: &[u8],
    domains: &DomainMatcher,
) -> std::result::Result<DecodedQuery, DecodeQueryError> {
    let mut cursor = Cursor::new(packet);
    let header = DnsHeader::parse(&mut cursor).map_err(|_| DecodeQueryError::Drop)?;

    if header.is_response() || header.qdcount != 1 {
        // Echo the first question when there is one; a broken one is not worth a reply
        let question = if header.qdcount == 0 {
            None
        } else {
            Some(Question::parse(&mut cursor).map_err(|_| DecodeQueryError::Drop)?)
        };
        return Err(reply(&header, question, Rcode::FormatError));
    }

    let question = Question::parse(&mut cursor).map_err(|_| DecodeQueryError::Drop)?;

    if question.qtype != RR_TXT {
        return Err(reply(&header, Some(question), Rcode::NameError));
    }

    let subdomain = match domains.extract_subdomain(&question.name) {
        Ok(subdomain) => undotify(subdomain),
        Err(rcode) => return Err(reply(&header, Some(question), rcode)),
    };
    if subdomain.is_empty() {
        return Err(reply(&header, Some(question), Rcode::NameError));
    }

    let payload = match base32_decode(&subdomain) {
        Ok(payload) => payload,
        Err(_) => return Err(reply(&header, Some(question), Rcode::ServerFailure)),
    };

    Ok(DecodedQuery {
        id: header.id,
        rd: header.recursion_desired(),
        cd: header.checking_disabled(),
        question,
        payload,
    })
}

/// Extract the tunnel payload from a response; `None` for anything but a single TXT answer
pub fn decode_response(packet: &[u8]) -> Option<Vec<u8>> {
    let mut cursor = Cursor::new(packet);
    let header = DnsHeader::parse(&mut cursor).ok()?;
    if !header.is_response() || header.rcode()? != Rcode::Ok || header.ancount != 1 {
        return None;
    }

    for _ in 0..header.qdcount {
        read_name(&mut cursor).ok()?;
        if cursor.remaining() < 4 {
            return None;
        }
        cursor.advance(4);
    }

    let answer = ResourceRecord::parse(&mut cursor).ok()?;
    if answer.rtype != RR_TXT || answer.rdata.is_empty() {
        return None;
    }

    let payload = read_txt_rdata(&answer.rdata)?;
    if payload.is_empty() {
        return None;
    }
    Some(payload)
}

/// QR bit set
pub fn is_response(packet: &[u8]) -> bool {
    let mut cursor = Cursor::new(packet);
    DnsHeader::parse(&mut cursor)
        .map(|header| header.is_response())
        .unwrap_or(false)
}

/// Transaction id of a response
pub fn response_id(packet: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(packet);
    let header = DnsHeader::parse(&mut cursor).ok()?;
    header.is_response().then_some(header.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::in_question;

    fn matcher() -> DomainMatcher {
        DomainMatcher::new(["t.example.com"])
    }

    fn rcode_of(response: &[u8]) -> Rcode {
        let mut cursor = Cursor::new(response);
        DnsHeader::parse(&mut cursor).unwrap().rcode().unwrap()
    }

    #[test]
    fn test_query_roundtrip() {
        let query = encode_query(b"hello quic", "t.example.com", 0x1234).unwrap();
        let decoded = decode_query(&query, &matcher()).unwrap();
        assert_eq!(decoded.id, 0x1234);
        assert!(decoded.rd);
        assert_eq!(decoded.payload, b"hello quic");
    }

    #[test]
    fn test_query_carries_opt() {
        let query = encode_query(b"x", "t.example.com", 1).unwrap();
        // Last 11 bytes: root, type 41, class 1232, ttl 0, rdlen 0
        let opt = &query[query.len() - 11..];
        assert_eq!(opt, &[0, 0, 41, 0x04, 0xD0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(u16::from_be_bytes([query[10], query[11]]), 1);
    }

    #[test]
    fn test_response_roundtrip() {
        let query = encode_query(b"q", "t.example.com", 9).unwrap();
        let decoded = decode_query(&query, &matcher()).unwrap();
        let payload = vec![0x5A; 700];
        let response = encode_response(&decoded.response(Some(payload.as_slice()), None)).unwrap();

        assert!(is_response(&response));
        assert_eq!(response_id(&response), Some(9));
        assert_eq!(rcode_of(&response), Rcode::Ok);
        assert_eq!(decode_response(&response).unwrap(), payload);
    }

    #[test]
    fn test_empty_response_defaults_to_name_error() {
        let question = in_question("abc.t.example.com.", RR_TXT);
        let response = encode_response(&ResponseParams {
            id: 1,
            rd: true,
            cd: false,
            question: Some(&question),
            payload: None,
            rcode: None,
        })
        .unwrap();
        assert_eq!(rcode_of(&response), Rcode::NameError);
        assert!(decode_response(&response).is_none());
    }

    #[test]
    fn test_explicit_ok_without_payload() {
        let question = in_question("abc.t.example.com.", RR_TXT);
        let response = encode_response(&ResponseParams {
            id: 1,
            rd: true,
            cd: false,
            question: Some(&question),
            payload: Some(&[][..]),
            rcode: Some(Rcode::Ok),
        })
        .unwrap();
        assert_eq!(rcode_of(&response), Rcode::Ok);
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 0);
        assert!(decode_response(&response).is_none());
    }

    #[test]
    fn test_response_copies_rd_cd() {
        let question = in_question("abc.t.example.com.", RR_TXT);
        let response = encode_response(&ResponseParams {
            id: 3,
            rd: false,
            cd: true,
            question: Some(&question),
            payload: Some(&b"data"[..]),
            rcode: None,
        })
        .unwrap();
        let mut cursor = Cursor::new(&response[..]);
        let header = DnsHeader::parse(&mut cursor).unwrap();
        assert!(!header.recursion_desired());
        assert!(header.checking_disabled());
        assert_eq!(header.flags & FLAG_AA, FLAG_AA);
    }

    #[test]
    fn test_oversized_response_rejected() {
        let question = in_question("a.test.com.", RR_TXT);
        let payload = vec![0u8; u16::MAX as usize];
        let params = ResponseParams {
            id: 0x1234,
            rd: false,
            cd: false,
            question: Some(&question),
            payload: Some(&payload),
            rcode: None,
        };
        assert!(encode_response(&params).is_err());
    }

    #[test]
    fn test_short_header_dropped() {
        assert_eq!(
            decode_query(&[0u8; 11], &matcher()).unwrap_err(),
            DecodeQueryError::Drop
        );
    }

    #[test]
    fn test_segment_queries() {
        let payload = vec![7u8; 40];
        let queries = segment_queries(&payload, 10, "t.example.com", 65535).unwrap();
        assert_eq!(queries.len(), 4);
        let ids: Vec<u16> = queries
            .iter()
            .map(|q| decode_query(q, &matcher()).unwrap().id)
            .collect();
        assert_eq!(ids, vec![65535, 0, 1, 2]);

        assert!(segment_queries(&payload, 7, "t.example.com", 0).is_err());
    }

    #[test]
    fn test_query_size_limit() {
        // A domain long enough to leave room only for a tiny payload
        let domain = format!("{}.{}.{}.example", "a".repeat(63), "b".repeat(63), "c".repeat(50));
        let max = crate::dns::max_payload_len_for_domain(&domain).unwrap();
        assert!(encode_query(&vec![1u8; max], &domain, 1).is_ok());
        assert!(encode_query(&vec![1u8; max + 1], &domain, 1).is_err());
    }
}
