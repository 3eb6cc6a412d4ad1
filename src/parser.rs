//! L2-L4 frame decoder.
//!
//! Decodes Ethernet (with single or stacked 802.1Q tags), IPv4, IPv6,
//! TCP, UDP and ICMP/ICMPv6 into a [`Packet`]. Non-IP frames still fill
//! the link-layer fields so `pre_create` plugins (e.g. ARP) can inspect
//! them; they create no flow.

use std::net::IpAddr;
use std::time::Duration;

use nom::IResult;
use nom::bytes::complete::take;
use nom::number::complete::{be_u8, be_u16, be_u32};
use nom_derive::{Nom, Parse};

use crate::packet::Packet;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88a8;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

struct EthHeader {
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    ethertype: u16,
}

fn parse_ethernet(i: &[u8]) -> IResult<&[u8], EthHeader> {
    let (i, dst) = take(6usize)(i)?;
    let (i, src) = take(6usize)(i)?;
    let (mut i, mut ethertype) = be_u16(i)?;

    // Skip over 802.1Q / 802.1ad tags, stacked or not.
    while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        let (rest, _tci) = be_u16(i)?;
        let (rest, inner) = be_u16(rest)?;
        i = rest;
        ethertype = inner;
    }

    let mut dst_mac = [0u8; 6];
    let mut src_mac = [0u8; 6];
    dst_mac.copy_from_slice(dst);
    src_mac.copy_from_slice(src);
    Ok((
        i,
        EthHeader {
            dst_mac,
            src_mac,
            ethertype,
        },
    ))
}

struct Ipv4Header {
    tos: u8,
    total_length: u16,
    ttl: u8,
    proto: u8,
    src: [u8; 4],
    dst: [u8; 4],
}

fn parse_ipv4(i: &[u8]) -> IResult<&[u8], Ipv4Header> {
    let input = i;
    let (i, ver_ihl) = be_u8(i)?;
    if ver_ihl >> 4 != 4 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    let header_len = usize::from(ver_ihl & 0x0f) * 4;
    let (i, tos) = be_u8(i)?;
    let (i, total_length) = be_u16(i)?;
    let (i, _id) = be_u16(i)?;
    let (i, _frag) = be_u16(i)?;
    let (i, ttl) = be_u8(i)?;
    let (i, proto) = be_u8(i)?;
    let (i, _csum) = be_u16(i)?;
    let (i, src) = take(4usize)(i)?;
    let (i, dst) = take(4usize)(i)?;
    // Options are skipped; header_len accounts for them.
    let (i, _options) = take(header_len.saturating_sub(20))(i)?;

    let mut src_ip = [0u8; 4];
    let mut dst_ip = [0u8; 4];
    src_ip.copy_from_slice(src);
    dst_ip.copy_from_slice(dst);
    Ok((
        i,
        Ipv4Header {
            tos,
            total_length,
            ttl,
            proto,
            src: src_ip,
            dst: dst_ip,
        },
    ))
}

struct Ipv6Header {
    traffic_class: u8,
    payload_length: u16,
    next_header: u8,
    hop_limit: u8,
    src: [u8; 16],
    dst: [u8; 16],
}

fn parse_ipv6(i: &[u8]) -> IResult<&[u8], Ipv6Header> {
    let input = i;
    let (i, ver_tc_fl) = be_u32(i)?;
    if ver_tc_fl >> 28 != 6 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    let traffic_class = ((ver_tc_fl >> 20) & 0xff) as u8;
    let (i, payload_length) = be_u16(i)?;
    let (i, next_header) = be_u8(i)?;
    let (i, hop_limit) = be_u8(i)?;
    let (i, src) = take(16usize)(i)?;
    let (i, dst) = take(16usize)(i)?;

    let mut src_ip = [0u8; 16];
    let mut dst_ip = [0u8; 16];
    src_ip.copy_from_slice(src);
    dst_ip.copy_from_slice(dst);
    Ok((
        i,
        Ipv6Header {
            traffic_class,
            payload_length,
            next_header,
            hop_limit,
            src: src_ip,
            dst: dst_ip,
        },
    ))
}

/// Fixed-position leading fields of a TCP header; the data offset and
/// flags byte follow and are handled by the caller.
#[derive(Nom)]
struct TcpHeaderStart {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
}

#[derive(Nom)]
struct UdpHeader {
    src_port: u16,
    dst_port: u16,
    #[allow(dead_code)]
    length: u16,
    #[allow(dead_code)]
    checksum: u16,
}

/// Decodes one captured frame into `pkt`.
///
/// Always fills the timestamp, the raw frame copy and the link-layer
/// fields. Returns true when an IPv4/IPv6 packet was decoded up to the
/// transport layer ("parsed"), false otherwise.
pub fn parse_frame(ts: Duration, data: &[u8], snaplen: usize, pkt: &mut Packet) -> bool {
    pkt.reset();
    pkt.timestamp = ts;

    let kept = data.len().min(snaplen);
    pkt.frame.extend_from_slice(&data[..kept]);

    let Ok((l3, eth)) = parse_ethernet(data) else {
        return false;
    };
    pkt.dst_mac = eth.dst_mac;
    pkt.src_mac = eth.src_mac;
    pkt.ethertype = eth.ethertype;
    // For non-IP frames the payload starts right after the link header.
    pkt.payload_offset = (data.len() - l3.len()).min(kept);

    let l4 = match eth.ethertype {
        ETHERTYPE_IPV4 => {
            let Ok((l4, ip)) = parse_ipv4(l3) else {
                return false;
            };
            pkt.ip_version = 4;
            pkt.ip_proto = ip.proto;
            pkt.ip_ttl = ip.ttl;
            pkt.ip_tos = ip.tos;
            pkt.ip_length = ip.total_length;
            pkt.src_ip = IpAddr::from(ip.src);
            pkt.dst_ip = IpAddr::from(ip.dst);
            l4
        }
        ETHERTYPE_IPV6 => {
            let Ok((l4, ip)) = parse_ipv6(l3) else {
                return false;
            };
            pkt.ip_version = 6;
            pkt.ip_proto = ip.next_header;
            pkt.ip_ttl = ip.hop_limit;
            pkt.ip_tos = ip.traffic_class;
            pkt.ip_length = ip.payload_length + 40;
            pkt.src_ip = IpAddr::from(ip.src);
            pkt.dst_ip = IpAddr::from(ip.dst);
            l4
        }
        _ => return false,
    };

    let payload = match pkt.ip_proto {
        IPPROTO_TCP => {
            let Ok((rest, tcp)) = TcpHeaderStart::parse_be(l4) else {
                return false;
            };
            let Ok((rest, off_flags)) = be_u16::<_, nom::error::Error<&[u8]>>(rest) else {
                return false;
            };
            pkt.src_port = tcp.src_port;
            pkt.dst_port = tcp.dst_port;
            pkt.tcp_seq = tcp.seq;
            pkt.tcp_ack = tcp.ack;
            pkt.tcp_flags = (off_flags & 0xff) as u8;
            let data_offset = usize::from(off_flags >> 12) * 4;
            // Remainder of the fixed header plus options.
            match take::<_, _, nom::error::Error<&[u8]>>(data_offset.saturating_sub(14))(rest) {
                Ok((payload, _)) => payload,
                Err(_) => return false,
            }
        }
        IPPROTO_UDP => {
            let Ok((payload, udp)) = UdpHeader::parse_be(l4) else {
                return false;
            };
            pkt.src_port = udp.src_port;
            pkt.dst_port = udp.dst_port;
            payload
        }
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            let Ok((payload, ty)) = be_u8::<_, nom::error::Error<&[u8]>>(l4) else {
                return false;
            };
            let Ok((payload, code)) = be_u8::<_, nom::error::Error<&[u8]>>(payload) else {
                return false;
            };
            // Type and code packed as the destination port.
            pkt.src_port = 0;
            pkt.dst_port = u16::from(ty) << 8 | u16::from(code);
            payload
        }
        _ => l4,
    };

    pkt.payload_offset = (data.len() - payload.len()).min(kept);
    true
}
