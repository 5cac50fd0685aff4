//! Minimal DNS wire format support: enough to send a recursion-desired
//! A query and pull the first IPv4 answer out of the response. No I/O
//! lives here; the resolver owns the socket.

use std::net::Ipv4Addr;
use thiserror::Error;

/// QTYPE A (host address)
pub const QTYPE_A: u16 = 1;
/// QCLASS IN
pub const QCLASS_IN: u16 = 1;

// Header flags: QR is the top bit, RD is bit 8, RCODE the low nibble.
const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const RCODE_MASK: u16 = 0x000F;

/// DnsError covers hostnames we refuse to encode and datagrams we
/// refuse to interpret.
#[derive(Debug, Error, PartialEq)]
pub enum DnsError {
    #[error("hostname not encodable as a DNS name: {0}")]
    BadName(String),

    #[error("malformed DNS datagram")]
    BadDatagram,
}

/// Answer is the distilled content of one DNS response: the queried
/// name and the first A record, if any. `addr` is `None` for NXDOMAIN,
/// server failures, and answer sections without an A record.
#[derive(Debug, PartialEq)]
pub struct Answer {
    pub id: u16,
    pub name: String,
    pub addr: Option<Ipv4Addr>,
}

/// encode_query builds a single-question, recursion-desired A/IN query
/// for `host` with the given transaction id.
pub fn encode_query(id: u16, host: &str) -> Result<Vec<u8>, DnsError> {
    let host = host.trim_end_matches('.');
    if host.is_empty() || host.len() > 253 {
        return Err(DnsError::BadName(host.to_string()));
    }

    let mut out = Vec::with_capacity(12 + host.len() + 6);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&FLAG_RD.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    // QNAME: length-prefixed labels, root terminator
    for label in host.split('.') {
        let bytes = label.as_bytes();
        if bytes.is_empty() || bytes.len() > 63 {
            return Err(DnsError::BadName(host.to_string()));
        }
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }
    out.push(0);

    out.extend_from_slice(&QTYPE_A.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(out)
}

/// decode_response parses one response datagram. Returns the queried
/// name (lowercased, no trailing dot) and the first A/IN answer record.
/// Datagrams that are not a single-question response are rejected.
pub fn decode_response(pkt: &[u8]) -> Result<Answer, DnsError> {
    if pkt.len() < 12 {
        return Err(DnsError::BadDatagram);
    }
    let id = u16::from_be_bytes([pkt[0], pkt[1]]);
    let flags = u16::from_be_bytes([pkt[2], pkt[3]]);
    if flags & FLAG_QR == 0 {
        // a query, not a response
        return Err(DnsError::BadDatagram);
    }
    let qd = u16::from_be_bytes([pkt[4], pkt[5]]);
    let an = u16::from_be_bytes([pkt[6], pkt[7]]) as usize;
    if qd != 1 {
        return Err(DnsError::BadDatagram);
    }

    // Question section: QNAME QTYPE QCLASS
    let (name, mut off) = read_name(pkt, 12, 0)?;
    if pkt.len() < off + 4 {
        return Err(DnsError::BadDatagram);
    }
    off += 4;

    if flags & RCODE_MASK != 0 {
        return Ok(Answer {
            id,
            name,
            addr: None,
        });
    }

    // Scan the answer section for the first A/IN record
    let mut addr = None;
    for _ in 0..an {
        let (_owner, mut rr) = read_name(pkt, off, 0)?;
        if pkt.len() < rr + 10 {
            return Err(DnsError::BadDatagram);
        }
        let rtype = u16::from_be_bytes([pkt[rr], pkt[rr + 1]]);
        let rclass = u16::from_be_bytes([pkt[rr + 2], pkt[rr + 3]]);
        // TYPE(2) CLASS(2) TTL(4) RDLENGTH(2)
        let rdlen = u16::from_be_bytes([pkt[rr + 8], pkt[rr + 9]]) as usize;
        rr += 10;
        if pkt.len() < rr + rdlen {
            return Err(DnsError::BadDatagram);
        }
        if rtype == QTYPE_A && rclass == QCLASS_IN && rdlen == 4 {
            addr = Some(Ipv4Addr::new(
                pkt[rr],
                pkt[rr + 1],
                pkt[rr + 2],
                pkt[rr + 3],
            ));
            break;
        }
        off = rr + rdlen;
    }

    Ok(Answer { id, name, addr })
}

/// read_name walks a (possibly compressed, RFC 1035) DNS name starting
/// at `off` and returns the lowercased dotted name plus the offset just
/// past it. Pointer nesting is depth-limited against malicious packets.
fn read_name(pkt: &[u8], off: usize, depth: usize) -> Result<(String, usize), DnsError> {
    if depth > 8 {
        return Err(DnsError::BadDatagram);
    }
    let mut labels: Vec<String> = Vec::with_capacity(4);
    let mut cur = off;
    let mut end = None;
    loop {
        let &len = pkt.get(cur).ok_or(DnsError::BadDatagram)?;
        cur += 1;
        match len {
            0 => break,
            l if l & 0xC0 == 0xC0 => {
                let &b2 = pkt.get(cur).ok_or(DnsError::BadDatagram)?;
                cur += 1;
                if end.is_none() {
                    end = Some(cur);
                }
                let target = (((l & 0x3F) as usize) << 8) | b2 as usize;
                let (rest, _) = read_name(pkt, target, depth + 1)?;
                if !rest.is_empty() {
                    labels.push(rest);
                }
                break;
            }
            l => {
                let l = l as usize;
                let label = pkt.get(cur..cur + l).ok_or(DnsError::BadDatagram)?;
                labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
                cur += l;
            }
        }
    }
    Ok((labels.join("."), end.unwrap_or(cur)))
}
