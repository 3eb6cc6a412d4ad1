//! Conjunctive packet filter applied to decoded packets.
//!
//! Supported terms: `tcp`, `udp`, `icmp`, `host <addr>`, `net <addr>/<len>`,
//! `port <num>`. Terms may be joined with an optional `and`; every term
//! must match. Applied before the cache, after L2-L4 decoding.

use std::net::IpAddr;

use crate::error::ProbeError;
use crate::packet::Packet;
use crate::parser::{IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Tcp,
    Udp,
    Icmp,
    Host(IpAddr),
    Net(IpAddr, u8),
    Port(u16),
}

#[derive(Debug, Clone, Default)]
pub struct PacketFilter {
    terms: Vec<Term>,
}

impl PacketFilter {
    pub fn parse(expr: &str) -> Result<PacketFilter, ProbeError> {
        let mut terms = Vec::new();
        let mut tokens = expr.split_whitespace().peekable();

        while let Some(tok) = tokens.next() {
            match tok {
                "and" => continue,
                "tcp" => terms.push(Term::Tcp),
                "udp" => terms.push(Term::Udp),
                "icmp" => terms.push(Term::Icmp),
                "host" => {
                    let addr = tokens
                        .next()
                        .ok_or_else(|| ProbeError::Config("filter: host needs an address".into()))?;
                    let addr: IpAddr = addr.parse().map_err(|_| {
                        ProbeError::Config(format!("filter: bad host address {:?}", addr))
                    })?;
                    terms.push(Term::Host(addr));
                }
                "net" => {
                    let spec = tokens
                        .next()
                        .ok_or_else(|| ProbeError::Config("filter: net needs addr/len".into()))?;
                    let (addr, len) = spec.split_once('/').ok_or_else(|| {
                        ProbeError::Config(format!("filter: bad net {:?}, expected addr/len", spec))
                    })?;
                    let addr: IpAddr = addr.parse().map_err(|_| {
                        ProbeError::Config(format!("filter: bad net address {:?}", addr))
                    })?;
                    let len: u8 = len.parse().map_err(|_| {
                        ProbeError::Config(format!("filter: bad prefix length {:?}", len))
                    })?;
                    let max = if addr.is_ipv4() { 32 } else { 128 };
                    if len > max {
                        return Err(ProbeError::Config(format!(
                            "filter: prefix length {} exceeds {}",
                            len, max
                        )));
                    }
                    terms.push(Term::Net(addr, len));
                }
                "port" => {
                    let port = tokens
                        .next()
                        .ok_or_else(|| ProbeError::Config("filter: port needs a number".into()))?;
                    let port: u16 = port.parse().map_err(|_| {
                        ProbeError::Config(format!("filter: bad port {:?}", port))
                    })?;
                    terms.push(Term::Port(port));
                }
                other => {
                    return Err(ProbeError::Config(format!(
                        "filter: unknown term {:?}",
                        other
                    )));
                }
            }
        }
        Ok(PacketFilter { terms })
    }

    pub fn matches(&self, pkt: &Packet) -> bool {
        self.terms.iter().all(|t| match t {
            Term::Tcp => pkt.ip_proto == IPPROTO_TCP,
            Term::Udp => pkt.ip_proto == IPPROTO_UDP,
            Term::Icmp => pkt.ip_proto == IPPROTO_ICMP || pkt.ip_proto == IPPROTO_ICMPV6,
            Term::Host(addr) => pkt.src_ip == *addr || pkt.dst_ip == *addr,
            Term::Net(addr, len) => {
                prefix_match(&pkt.src_ip, addr, *len) || prefix_match(&pkt.dst_ip, addr, *len)
            }
            Term::Port(port) => pkt.src_port == *port || pkt.dst_port == *port,
        })
    }
}

fn prefix_match(candidate: &IpAddr, net: &IpAddr, len: u8) -> bool {
    fn bits_match(a: &[u8], b: &[u8], len: u8) -> bool {
        let full = usize::from(len / 8);
        if a[..full] != b[..full] {
            return false;
        }
        let rem = len % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        (a[full] & mask) == (b[full] & mask)
    }
    match (candidate, net) {
        (IpAddr::V4(c), IpAddr::V4(n)) => bits_match(&c.octets(), &n.octets(), len),
        (IpAddr::V6(c), IpAddr::V6(n)) => bits_match(&c.octets(), &n.octets(), len),
        _ => false,
    }
}
