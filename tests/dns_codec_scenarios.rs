//! DNS encapsulation as seen from both ends of the tunnel

use dnsquic::dns::codec::encode_message;
use dnsquic::dns::qname::build_qname;
use dnsquic::dns::{
    decode_query, decode_response, encode_query, encode_response, max_payload_len_for_domain,
    DecodeQueryError, DnsHeader, DomainMatcher, QueryParams, Rcode, ResponseParams, RR_A, RR_TXT,
};
use std::io::Cursor;

fn header_of(packet: &[u8]) -> DnsHeader {
    DnsHeader::parse(&mut Cursor::new(packet)).unwrap()
}

fn reply_rcode(err: &DecodeQueryError) -> Rcode {
    match err {
        DecodeQueryError::Reply { rcode, .. } => *rcode,
        DecodeQueryError::Drop => panic!("expected a reply, got a drop"),
    }
}

fn quic_like_packet(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[test]
fn test_client_packet_reaches_server_intact() {
    let matcher = DomainMatcher::new(["t.example.com"]);
    let packet = quic_like_packet(120);

    let query = encode_query(&packet, "t.example.com", 0x1234).unwrap();
    let decoded = decode_query(&query, &matcher).unwrap();

    assert_eq!(decoded.id, 0x1234);
    assert!(decoded.rd);
    assert_eq!(decoded.question.qtype, RR_TXT);
    assert_eq!(decoded.payload, packet);
}

#[test]
fn test_every_payload_length_up_to_the_limit() {
    for domain in [
        "t.example.com",
        "a.b",
        "a123456789.b123456789.c123456789.d123456789.tunnel.example.net",
    ] {
        let matcher = DomainMatcher::new([domain]);
        let max = max_payload_len_for_domain(domain).unwrap();
        assert!(max > 0, "{}", domain);

        for len in 1..=max {
            let packet = quic_like_packet(len);
            let query = encode_query(&packet, domain, len as u16).unwrap();
            let decoded = decode_query(&query, &matcher).unwrap();
            assert_eq!(decoded.payload, packet, "{} bytes under {}", len, domain);
        }
        assert!(encode_query(&quic_like_packet(max + 1), domain, 0).is_err());
    }
}

#[test]
fn test_empty_payload_is_a_name_error() {
    let matcher = DomainMatcher::new(["t.example.com"]);
    let query = encode_query(&[], "t.example.com", 5).unwrap();
    let err = decode_query(&query, &matcher).unwrap_err();
    assert_eq!(reply_rcode(&err), Rcode::NameError);
}

#[test]
fn test_resolver_case_mangling_is_tolerated() {
    let matcher = DomainMatcher::new(["t.example.com"]);
    let packet = quic_like_packet(64);
    let qname = build_qname(&packet, "t.example.com").unwrap();
    let mangled: String = qname
        .chars()
        .enumerate()
        .map(|(i, c)| if i % 2 == 0 { c.to_ascii_lowercase() } else { c })
        .collect();

    let query = encode_message(&QueryParams::txt(9, &mangled)).unwrap();
    let decoded = decode_query(&query, &matcher).unwrap();
    assert_eq!(decoded.payload, packet);
}

#[test]
fn test_nested_domains_use_longest_suffix() {
    let matcher = DomainMatcher::new(["example.com", "t.example.com"]);
    let packet = quic_like_packet(30);

    let query = encode_query(&packet, "t.example.com", 1).unwrap();
    let decoded = decode_query(&query, &matcher).unwrap();
    assert_eq!(decoded.payload, packet);

    let query = encode_query(&packet, "example.com", 2).unwrap();
    let decoded = decode_query(&query, &matcher).unwrap();
    assert_eq!(decoded.payload, packet);
}

#[test]
fn test_server_answer_reaches_client_intact() {
    let matcher = DomainMatcher::new(["t.example.com"]);
    let query = encode_query(b"poll", "t.example.com", 77).unwrap();
    let decoded = decode_query(&query, &matcher).unwrap();

    // Larger than one TXT string, so the answer is chunked
    let packet = quic_like_packet(700);
    let response = encode_response(&decoded.response(Some(packet.as_slice()), None)).unwrap();

    let header = header_of(&response);
    assert_eq!(header.id, 77);
    assert_eq!(header.rcode(), Some(Rcode::Ok));
    assert_eq!(header.ancount, 1);
    assert_eq!(decode_response(&response), Some(packet));
}

#[test]
fn test_empty_poll_answer_is_noerror_without_records() {
    let matcher = DomainMatcher::new(["t.example.com"]);
    let query = encode_query(b"poll", "t.example.com", 5).unwrap();
    let decoded = decode_query(&query, &matcher).unwrap();

    let response = encode_response(&decoded.response(None, Some(Rcode::Ok))).unwrap();
    let header = header_of(&response);
    assert_eq!(header.rcode(), Some(Rcode::Ok));
    assert_eq!(header.ancount, 0);
    assert_eq!(decode_response(&response), None);
}

#[test]
fn test_foreign_queries_get_error_replies() {
    let matcher = DomainMatcher::new(["t.example.com"]);

    let other_domain = encode_query(b"data", "elsewhere.org", 1).unwrap();
    let err = decode_query(&other_domain, &matcher).unwrap_err();
    assert_eq!(reply_rcode(&err), Rcode::NameError);

    let qname = build_qname(b"data", "t.example.com").unwrap();
    let mut params = QueryParams::txt(2, &qname);
    params.qtype = RR_A;
    let a_query = encode_message(&params).unwrap();
    let err = decode_query(&a_query, &matcher).unwrap_err();
    assert_eq!(reply_rcode(&err), Rcode::NameError);

    let garbage = encode_message(&QueryParams::txt(3, "not-base32!.t.example.com")).unwrap();
    let err = decode_query(&garbage, &matcher).unwrap_err();
    assert_eq!(reply_rcode(&err), Rcode::ServerFailure);

    let apex = encode_message(&QueryParams::txt(4, "t.example.com")).unwrap();
    let err = decode_query(&apex, &matcher).unwrap_err();
    assert_eq!(reply_rcode(&err), Rcode::NameError);
}

#[test]
fn test_error_reply_keeps_id_and_question() {
    let matcher = DomainMatcher::new(["t.example.com"]);
    let query = encode_query(b"data", "elsewhere.org", 0xBEEF).unwrap();
    let err = decode_query(&query, &matcher).unwrap_err();

    let response = err.to_response().unwrap();
    let header = header_of(&response);
    assert!(header.is_response());
    assert_eq!(header.id, 0xBEEF);
    assert_eq!(header.qdcount, 1);
    assert_eq!(header.rcode(), Some(Rcode::NameError));
}

#[test]
fn test_questionless_query_is_format_error() {
    let matcher = DomainMatcher::new(["t.example.com"]);
    let qname = build_qname(b"data", "t.example.com").unwrap();
    let mut params = QueryParams::txt(6, &qname);
    params.qdcount = 0;
    let query = encode_message(&params).unwrap();

    let err = decode_query(&query, &matcher).unwrap_err();
    assert_eq!(reply_rcode(&err), Rcode::FormatError);

    let response = err.to_response().unwrap();
    let header = header_of(&response);
    assert_eq!(header.qdcount, 0);
    assert_eq!(header.rcode(), Some(Rcode::FormatError));
}

#[test]
fn test_responses_are_never_answered() {
    let matcher = DomainMatcher::new(["t.example.com"]);
    let response = encode_response(&ResponseParams {
        id: 1,
        rd: true,
        cd: false,
        question: None,
        payload: None,
        rcode: Some(Rcode::Ok),
    })
    .unwrap();
    let err = decode_query(&response, &matcher).unwrap_err();
    assert_eq!(reply_rcode(&err), Rcode::FormatError);

    assert!(matches!(
        decode_query(&[0u8; 5], &matcher),
        Err(DecodeQueryError::Drop)
    ));
}
