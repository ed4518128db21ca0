// DNS encapsulation for the QUIC tunnel
//
// Upstream QUIC packets ride in the QNAME of TXT queries (base32, dotted,
// suffixed with a tunnel domain). Downstream packets ride in the TXT answer.
//
// - protocol: wire header, names, questions, rcodes
// - qname: base32 + dot framing and tunnel-domain suffix matching
// - codec: query/response encode and decode with the rcode policy
// - transport: tokio UDP socket plumbing

pub mod codec;
pub mod protocol;
pub mod qname;
pub mod transport;

pub use codec::{
    decode_query, decode_response, encode_query, encode_response, is_response, response_id,
    segment_queries, DecodeQueryError, DecodedQuery, QueryParams, ResponseParams,
};
pub use protocol::{DnsHeader, Question, Rcode};
pub use qname::{build_qname, max_payload_len_for_domain, DomainMatcher};
pub use transport::{normalize_dual_stack_addr, Datagram, DnsSocket};

use thiserror::Error;

/// Maximum DNS label length (RFC 1035)
pub const MAX_DNS_LABEL_LEN: usize = 63;

/// Maximum DNS name length in presentation form, without the trailing dot
pub const MAX_DNS_NAME_LEN: usize = 253;

/// Maximum size of an encoded query
pub const DNS_MAX_QUERY_SIZE: usize = 512;

/// UDP payload size advertised in the OPT pseudo-record
pub const EDNS_UDP_PAYLOAD: u16 = 1232;

/// Base32 characters between inserted dots
pub const DOT_INTERVAL: usize = 57;

/// TTL on tunnel answers
pub const ANSWER_TTL: u32 = 60;

pub const RR_A: u16 = 1;
pub const RR_TXT: u16 = 16;
pub const RR_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),

    #[error("Packet too large: {0} bytes (max: {1})")]
    PacketTooLarge(usize, usize),

    #[error("Invalid DNS message: {0}")]
    InvalidMessage(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DnsError>;
