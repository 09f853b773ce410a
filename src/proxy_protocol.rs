//! PROXY protocol filter (spec §4.12): parses a HAProxy PROXY protocol
//! v1 (text) or v2 (binary) preamble off the front of a connection and
//! replaces the advertised remote/local address before the rest of the
//! byte stream is handed to the HTTP layer.
//!
//! Grounded directly in the teacher's C sibling `main/proxy_protocol.c`:
//! same v1/v2 signatures, same binary header layout and per-family address
//! lengths, same "must arrive in a single read" rule (a v2 header that
//! needs more data than we got in one read is treated as a protocol
//! error, not a retry — see `li_proxy_protocol_parse`'s
//! `NEED_MORE_DATA` handling in `proxy_prot_parse_cq`). The filter itself
//! is wired into the [`crate::stream`] graph exactly like the C file wires
//! `liConnectionProxyProtocolFilter` into the stream graph: a
//! [`crate::stream::StreamHandler`] that, once the header is consumed,
//! becomes a transparent pass-through.

use std::cell::{Cell, RefCell};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::chunk::ChunkQueue;
use crate::event_loop::job::JobRef;
use crate::stream::{StreamEvent, StreamHandler, StreamRef};

const V1_SIG: &[u8] = b"PROXY ";
const V2_SIG: &[u8] = b"\x0D\x0A\x0D\x0A\x00\x0D\x0AQUIT\x0A";
const V2_HEADER_LEN: usize = 16;
const V2_MAX_INITIAL_LEN: usize = V2_HEADER_LEN + 2 * 108;
/// Default cap on a v2 TLV section; in the original this is a server-wide
/// config option (`proxy_protocol.tlv_max_length`), not yet wired up here.
const DEFAULT_MAX_TLV_LENGTH: usize = 4096;

/// Layer-4 transport carried by a v2 header (spec/source: `raw_transport`
/// nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Unspec,
    Stream,
    Datagram,
}

/// An endpoint address as carried by either protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyAddr {
    Inet(SocketAddr),
    Unix(Vec<u8>),
    Unspecified,
}

/// Parsed PROXY protocol preamble (spec: `liProxyProtocolData`).
#[derive(Debug, Clone, Default)]
pub struct ProxyProtocolData {
    pub version: u8,
    pub transport: Option<Transport>,
    pub remote: Option<ProxyAddr>,
    pub local: Option<ProxyAddr>,
    skip_bytes: usize,
    remaining_tlv_bytes: usize,
    pub tlvs: Vec<u8>,
}

/// Outcome of parsing a single header buffer (spec: `liProxyProtocolParseResult`).
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    NeedMoreData,
    Error(&'static str),
    Done,
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || (s.starts_with('0') && s.len() > 1) || s.starts_with('-') {
        return None;
    }
    s.parse().ok()
}

fn parse_v1(data: &mut ProxyProtocolData, header: &[u8]) -> ParseOutcome {
    let cr = match header.iter().position(|&b| b == b'\r') {
        Some(i) if i + 1 < header.len() && header[i + 1] == b'\n' => i,
        Some(_) => return ParseOutcome::Error("PROXY protocol v1: invalid header end"),
        None => return ParseOutcome::Error("PROXY protocol v1: header incomplete"),
    };
    data.skip_bytes = cr + 2;
    let line = match std::str::from_utf8(&header[V1_SIG.len()..cr]) {
        Ok(s) => s,
        Err(_) => return ParseOutcome::Error("PROXY protocol v1: invalid header"),
    };

    if let Some(rest) = line.strip_prefix("UNKNOWN") {
        let _ = rest;
        data.version = 1;
        return ParseOutcome::Done;
    }

    let (is_v4, rest) = if let Some(rest) = line.strip_prefix("TCP4 ") {
        (true, rest)
    } else if let Some(rest) = line.strip_prefix("TCP6 ") {
        (false, rest)
    } else {
        return ParseOutcome::Error("PROXY protocol v1: invalid header");
    };

    let mut parts = rest.split(' ');
    let (Some(s_remote_ip), Some(s_local_ip), Some(s_remote_port), Some(s_local_port)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return ParseOutcome::Error("PROXY protocol v1: invalid header");
    };

    let build = |ip: &str, port: &str, is_v4: bool| -> Option<SocketAddr> {
        let port = parse_port(port)?;
        if is_v4 {
            Some(SocketAddr::V4(SocketAddrV4::new(ip.parse::<Ipv4Addr>().ok()?, port)))
        } else {
            Some(SocketAddr::V6(SocketAddrV6::new(ip.parse::<Ipv6Addr>().ok()?, port, 0, 0)))
        }
    };

    let remote = match build(s_remote_ip, s_remote_port, is_v4) {
        Some(a) => a,
        None => return ParseOutcome::Error("PROXY protocol v1: invalid header"),
    };
    let local = match build(s_local_ip, s_local_port, is_v4) {
        Some(a) => a,
        None => return ParseOutcome::Error("PROXY protocol v1: invalid header"),
    };

    data.remote = Some(ProxyAddr::Inet(remote));
    data.local = Some(ProxyAddr::Inet(local));
    data.version = 1;
    ParseOutcome::Done
}

fn parse_v2(data: &mut ProxyProtocolData, header: &[u8]) -> ParseOutcome {
    let version = header[12] >> 4;
    let command = header[12] & 0xf;
    let family = header[13] >> 4;
    let raw_transport = header[13] & 0xf;
    let payload_len = ((header[14] as usize) << 8) | header[15] as usize;
    let total_len = payload_len + V2_HEADER_LEN;
    let available_payload_len = header.len() - V2_HEADER_LEN;
    let address_data = &header[V2_HEADER_LEN..];

    if version != 2 {
        return ParseOutcome::Error("invalid PROXY protocol version in binary header");
    }
    if command == 0 {
        data.skip_bytes = total_len;
        return ParseOutcome::Done;
    }
    if command != 1 {
        return ParseOutcome::Error("invalid PROXY protocol command");
    }
    if raw_transport > 2 {
        return ParseOutcome::Error("invalid PROXY protocol transport");
    }

    let required_address_len: usize = match family {
        0x00 => 0,
        0x01 => 12,
        0x02 => 36,
        0x03 => 216,
        _ => return ParseOutcome::Error("invalid PROXY protocol family"),
    };

    if required_address_len > payload_len {
        return ParseOutcome::Error("invalid PROXY protocol address length");
    }
    if required_address_len > available_payload_len {
        return ParseOutcome::NeedMoreData;
    }

    match family {
        0x01 => {
            let rip = Ipv4Addr::new(address_data[0], address_data[1], address_data[2], address_data[3]);
            let lip = Ipv4Addr::new(address_data[4], address_data[5], address_data[6], address_data[7]);
            let rport = u16::from_be_bytes([address_data[8], address_data[9]]);
            let lport = u16::from_be_bytes([address_data[10], address_data[11]]);
            data.remote = Some(ProxyAddr::Inet(SocketAddr::V4(SocketAddrV4::new(rip, rport))));
            data.local = Some(ProxyAddr::Inet(SocketAddr::V4(SocketAddrV4::new(lip, lport))));
        }
        0x02 => {
            let mut rraw = [0u8; 16];
            let mut lraw = [0u8; 16];
            rraw.copy_from_slice(&address_data[0..16]);
            lraw.copy_from_slice(&address_data[16..32]);
            let rport = u16::from_be_bytes([address_data[32], address_data[33]]);
            let lport = u16::from_be_bytes([address_data[34], address_data[35]]);
            data.remote = Some(ProxyAddr::Inet(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(rraw), rport, 0, 0))));
            data.local = Some(ProxyAddr::Inet(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(lraw), lport, 0, 0))));
        }
        0x03 => {
            data.remote = Some(ProxyAddr::Unix(address_data[0..108].to_vec()));
            data.local = Some(ProxyAddr::Unix(address_data[108..216].to_vec()));
        }
        _ => data.remote = Some(ProxyAddr::Unspecified),
    }

    data.version = version;
    data.transport = Some(match raw_transport {
        1 => Transport::Stream,
        2 => Transport::Datagram,
        _ => Transport::Unspec,
    });

    if required_address_len == 0 {
        data.skip_bytes = total_len;
    } else {
        data.skip_bytes = required_address_len + V2_HEADER_LEN;
        data.remaining_tlv_bytes = total_len - data.skip_bytes;
        if data.remaining_tlv_bytes > DEFAULT_MAX_TLV_LENGTH {
            return ParseOutcome::Error("PROXY TLV section too big");
        }
    }

    ParseOutcome::Done
}

/// Parse whatever header bytes are available so far (spec
/// `li_proxy_protocol_parse`).
pub fn parse(data: &mut ProxyProtocolData, header: &[u8]) -> ParseOutcome {
    if header.is_empty() {
        return ParseOutcome::NeedMoreData;
    }
    let v2_sig_len = V2_SIG.len().min(header.len());
    if header[..v2_sig_len] == V2_SIG[..v2_sig_len] {
        if header.len() < V2_HEADER_LEN {
            return ParseOutcome::NeedMoreData;
        }
        return parse_v2(data, header);
    }
    let v1_sig_len = V1_SIG.len().min(header.len());
    if header[..v1_sig_len] == V1_SIG[..v1_sig_len] {
        if header.len() < V1_SIG.len() {
            return ParseOutcome::NeedMoreData;
        }
        return parse_v1(data, header);
    }
    ParseOutcome::Done
}

struct FilterHandler {
    data: RefCell<ProxyProtocolData>,
    done: Cell<bool>,
    on_destroy: Option<JobRef>,
}

impl FilterHandler {
    /// Drive parsing forward with whatever's newly available in `in_q`.
    /// `Err` means a protocol violation: the caller should reset the
    /// stream (spec: `proxy_prot_parse_cq` returning `FALSE`).
    fn parse_cq(&self, in_q: &mut ChunkQueue) -> Result<(), &'static str> {
        if in_q.length() == 0 {
            return Ok(());
        }
        let mut data = self.data.borrow_mut();

        if data.version == 0 {
            in_q.cache_file_reads().map_err(|_| "failed to read PROXY protocol header")?;
            let n = (V2_MAX_INITIAL_LEN as u64).min(in_q.length());
            let header = in_q.extract_to_memory(n).map_err(|_| "failed to read PROXY protocol header")?;
            match parse(&mut data, &header) {
                ParseOutcome::NeedMoreData => {
                    return Err("segmented PROXY protocol handshake; must arrive in one segment");
                }
                ParseOutcome::Error(msg) => return Err(msg),
                ParseOutcome::Done => {}
            }
        }

        if data.skip_bytes > 0 {
            let skipped = in_q.skip(data.skip_bytes as u64) as usize;
            data.skip_bytes -= skipped;
            if data.skip_bytes > 0 {
                return Ok(());
            }
        }

        if data.remaining_tlv_bytes > 0 {
            if (data.remaining_tlv_bytes as u64) > in_q.length() {
                return Ok(());
            }
            let n = data.remaining_tlv_bytes as u64;
            data.tlvs = in_q.extract_to_bytearray(n).map_err(|_| "failed to extract PROXY protocol TLVs")?;
            data.remaining_tlv_bytes = 0;
        }

        self.done.set(true);
        Ok(())
    }

    fn handle_data(&self, stream: &StreamRef) {
        if stream.out().is_closed {
            StreamRef::disconnect(stream);
            return;
        }
        let source = stream.source();
        if let Some(source) = &source {
            if !self.done.get() {
                let mut in_q = source.out();
                let result = self.parse_cq(&mut in_q);
                drop(in_q);
                if result.is_err() {
                    StreamRef::reset(stream);
                    return;
                }
            }
            if self.done.get() {
                let mut in_q = source.out();
                if in_q.length() > 0 {
                    let mut out = stream.out();
                    ChunkQueue::steal_all(&mut out, &mut in_q);
                    drop(out);
                    drop(in_q);
                    StreamRef::notify(stream);
                    return;
                }
            }
        }

        let closed = source.as_ref().map_or(true, |s| s.out().is_closed);
        if closed {
            stream.out().is_closed = true;
            StreamRef::notify(stream);
            StreamRef::disconnect(stream);
        }
    }
}

impl StreamHandler for FilterHandler {
    fn handle(&self, stream: &StreamRef, event: StreamEvent) {
        match event {
            StreamEvent::NewData => self.handle_data(stream),
            StreamEvent::DisconnectedDest => StreamRef::disconnect(stream),
            StreamEvent::DisconnectedSource => StreamRef::disconnect_dest(stream),
            StreamEvent::Destroy => {
                if let Some(job) = &self.on_destroy {
                    job.async_signal();
                }
            }
            StreamEvent::NewCqLimit | StreamEvent::ConnectedSource | StreamEvent::ConnectedDest => {}
        }
    }
}

/// Build a new PROXY protocol filter stream. `on_destroy`, if given, is
/// signalled when the filter's `Destroy` event fires (spec: connection
/// reset scheduled via `li_job_later` in `proxy_prot_cb`'s destroy arm).
pub fn new_filter(on_destroy: Option<JobRef>) -> StreamRef {
    StreamRef::new(
        "proxy-protocol",
        Box::new(FilterHandler { data: RefCell::new(ProxyProtocolData::default()), done: Cell::new(false), on_destroy }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::plug::Plug;

    #[test]
    fn v1_tcp4_header_is_parsed_and_stripped() {
        let mut data = ProxyProtocolData::default();
        let header = b"PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\nGET / HTTP/1.1\r\n";
        let outcome = parse(&mut data, header);
        assert_eq!(outcome, ParseOutcome::Done);
        assert_eq!(data.version, 1);
        assert_eq!(
            data.remote,
            Some(ProxyAddr::Inet("192.168.0.1:56324".parse().unwrap()))
        );
        assert_eq!(
            data.local,
            Some(ProxyAddr::Inet("192.168.0.11:443".parse().unwrap()))
        );
    }

    #[test]
    fn v1_unknown_has_no_addresses() {
        let mut data = ProxyProtocolData::default();
        let outcome = parse(&mut data, b"PROXY UNKNOWN\r\n");
        assert_eq!(outcome, ParseOutcome::Done);
        assert_eq!(data.version, 1);
        assert!(data.remote.is_none());
    }

    #[test]
    fn v2_ipv4_header_is_parsed() {
        let mut data = ProxyProtocolData::default();
        let mut header = V2_SIG.to_vec();
        header.push(0x21); // version 2, command PROXY
        header.push(0x11); // AF_INET, STREAM
        header.extend_from_slice(&12u16.to_be_bytes());
        header.extend_from_slice(&[10, 0, 0, 1]); // src ip
        header.extend_from_slice(&[10, 0, 0, 2]); // dst ip
        header.extend_from_slice(&1234u16.to_be_bytes());
        header.extend_from_slice(&443u16.to_be_bytes());

        let outcome = parse(&mut data, &header);
        assert_eq!(outcome, ParseOutcome::Done);
        assert_eq!(data.remote, Some(ProxyAddr::Inet("10.0.0.1:1234".parse().unwrap())));
        assert_eq!(data.local, Some(ProxyAddr::Inet("10.0.0.2:443".parse().unwrap())));
        assert_eq!(data.transport, Some(Transport::Stream));
    }

    #[test]
    fn v2_local_command_skips_without_addresses() {
        let mut data = ProxyProtocolData::default();
        let mut header = V2_SIG.to_vec();
        header.push(0x20); // version 2, command LOCAL
        header.push(0x00);
        header.extend_from_slice(&0u16.to_be_bytes());
        let outcome = parse(&mut data, &header);
        assert_eq!(outcome, ParseOutcome::Done);
        assert!(data.remote.is_none());
    }

    #[test]
    fn plain_http_request_is_left_untouched() {
        let mut data = ProxyProtocolData::default();
        let outcome = parse(&mut data, b"GET / HTTP/1.1\r\n");
        assert_eq!(outcome, ParseOutcome::Done);
        assert_eq!(data.version, 0);
    }

    #[test]
    fn filter_strips_header_then_passes_the_rest_through() {
        let filter = new_filter(None);
        let upstream = Plug::new("upstream");
        StreamRef::connect(&upstream, &filter);

        upstream.out().append_string("PROXY TCP4 1.2.3.4 5.6.7.8 1111 2222\r\nGET / HTTP/1.1\r\n");
        StreamRef::notify(&upstream);

        assert_eq!(filter.out().extract_to_memory(16).unwrap(), b"GET / HTTP/1.1\r\n");
    }
}
