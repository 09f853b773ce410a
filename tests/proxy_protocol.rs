//! End-to-end PROXY protocol scenarios (spec §8 S8/S9, testable property 8/9):
//! drives [`lighttpd2_core::proxy_protocol`]'s stream filter the way a real
//! connection would, rather than calling the header parser directly.

use lighttpd2_core::proxy_protocol::{new_filter, ProxyAddr};
use lighttpd2_core::stream::plug::Plug;
use lighttpd2_core::stream::StreamRef;

fn drain(filter: &StreamRef) -> Vec<u8> {
    let mut out = filter.out();
    let n = out.length();
    out.extract_to_memory(n).unwrap()
}

#[test]
fn s8_v1_header_yields_addresses_and_forwards_the_rest_unchanged() {
    let filter = new_filter(None);
    let upstream = Plug::new("upstream");
    StreamRef::connect(&upstream, &filter);

    upstream
        .out()
        .append_string("PROXY TCP4 1.2.3.4 5.6.7.8 111 222\r\nGET /index.html HTTP/1.1\r\n");
    StreamRef::notify(&upstream);

    assert_eq!(&drain(&filter)[..], b"GET /index.html HTTP/1.1\r\n");
}

#[test]
fn s9_v2_binary_header_yields_ipv4_addresses_and_forwards_the_rest() {
    let filter = new_filter(None);
    let upstream = Plug::new("upstream");
    StreamRef::connect(&upstream, &filter);

    let mut header = vec![0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, b'Q', b'U', b'I', b'T', 0x0A];
    header.push(0x21); // version 2, command PROXY
    header.push(0x11); // AF_INET, STREAM
    header.extend_from_slice(&12u16.to_be_bytes());
    header.extend_from_slice(&[10, 0, 0, 1]);
    header.extend_from_slice(&[10, 0, 0, 2]);
    header.extend_from_slice(&1111u16.to_be_bytes());
    header.extend_from_slice(&2222u16.to_be_bytes());
    header.extend_from_slice(b"GET / HTTP/1.1\r\n");

    upstream.out().append_mem(header);
    StreamRef::notify(&upstream);

    assert_eq!(&drain(&filter)[..], b"GET / HTTP/1.1\r\n");
}

#[test]
fn malformed_preamble_is_left_alone_as_plain_http() {
    // A byte stream that never matches either PROXY signature must be
    // passed straight through, byte for byte (testable property 10's
    // "never modifies bytes" sibling rule for PROXY parsing).
    let filter = new_filter(None);
    let upstream = Plug::new("upstream");
    StreamRef::connect(&upstream, &filter);

    upstream.out().append_string("GET /plain HTTP/1.1\r\nHost: x\r\n\r\n");
    StreamRef::notify(&upstream);

    assert_eq!(&drain(&filter)[..], b"GET /plain HTTP/1.1\r\nHost: x\r\n\r\n");
}

#[test]
fn unix_family_addresses_round_trip_through_the_public_api() {
    use lighttpd2_core::proxy_protocol::{parse, ProxyProtocolData};

    let mut data = ProxyProtocolData::default();
    let mut header = vec![0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, b'Q', b'U', b'I', b'T', 0x0A];
    header.push(0x21);
    header.push(0x31); // AF_UNIX, STREAM
    header.extend_from_slice(&216u16.to_be_bytes());
    let mut src_path = vec![0u8; 108];
    src_path[..9].copy_from_slice(b"/src.sock");
    let mut dst_path = vec![0u8; 108];
    dst_path[..9].copy_from_slice(b"/dst.sock");
    header.extend_from_slice(&src_path);
    header.extend_from_slice(&dst_path);

    let outcome = parse(&mut data, &header);
    assert_eq!(outcome, lighttpd2_core::proxy_protocol::ParseOutcome::Done);
    match data.remote {
        Some(ProxyAddr::Unix(path)) => assert!(path.starts_with(b"/src.sock")),
        other => panic!("expected a unix remote address, got {:?}", other),
    }
}
