//! Minimal Ethernet/IPv4/TCP frame walk for the replay harness.
//!
//! Pulls out exactly the fields the data plane's packet contract needs:
//! the canonical 5-tuple, ACK number, window, flags, and the timestamp
//! echo reply (TSecr) from the TCP options. Everything else is skipped.

/// TCP fields extracted from one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFields {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub ack: u32,
    pub win: u16,
    pub flags: u8,
    /// Timestamp echo reply from the TCP options; 0 when the option is absent.
    pub tsecr: u32,
}

/// Protocol dispatch result for one frame. Non-TCP traffic carries no
/// per-flow state but is still hashed and forwarded, so the addresses come
/// along for the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    Tcp(TcpFields),
    Stateless { proto: u8, src_ip: u32, dst_ip: u32 },
}

const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_IGMP: u8 = 2;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
const TCPOPT_EOL: u8 = 0;
const TCPOPT_NOP: u8 = 1;
const TCPOPT_TIMESTAMP: u8 = 8;

#[inline]
fn be16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

#[inline]
fn be32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// Walk one Ethernet frame. Returns `None` for truncated or non-IPv4 frames.
pub fn parse_frame(frame: &[u8]) -> Option<Parsed> {
    if frame.len() < 14 + 20 {
        return None;
    }
    if be16(frame, 12) != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = &frame[14..];
    let ihl = (ip[0] & 0x0F) as usize * 4;
    if ip[0] >> 4 != 4 || ihl < 20 || ip.len() < ihl {
        return None;
    }
    let proto = ip[9];
    match proto {
        IPPROTO_TCP => {
            let tcp = &ip[ihl..];
            if tcp.len() < 20 {
                return None;
            }
            let data_off = (tcp[12] >> 4) as usize * 4;
            if data_off < 20 || tcp.len() < data_off {
                return None;
            }
            Some(Parsed::Tcp(TcpFields {
                src_ip: be32(ip, 12),
                dst_ip: be32(ip, 16),
                src_port: be16(tcp, 0),
                dst_port: be16(tcp, 2),
                ack: be32(tcp, 8),
                win: be16(tcp, 14),
                flags: tcp[13],
                tsecr: parse_tsecr(&tcp[20..data_off]),
            }))
        }
        _ => Some(Parsed::Stateless {
            proto,
            src_ip: be32(ip, 12),
            dst_ip: be32(ip, 16),
        }),
    }
}

/// Scan the TCP options for the timestamp option and return its TSecr.
fn parse_tsecr(mut opts: &[u8]) -> u32 {
    while let Some(&kind) = opts.first() {
        match kind {
            TCPOPT_EOL => break,
            TCPOPT_NOP => opts = &opts[1..],
            _ => {
                let Some(&len) = opts.get(1) else { break };
                let len = len as usize;
                if len < 2 || opts.len() < len {
                    break;
                }
                if kind == TCPOPT_TIMESTAMP && len == 10 {
                    // kind(1) len(1) TSval(4) TSecr(4)
                    return be32(opts, 6);
                }
                opts = &opts[len..];
            }
        }
    }
    0
}

/// Canonical 32-bit fingerprint of the 5-tuple.
///
/// A stable wire hash, not a process-seeded one: the same flow must map to
/// the same bucket across restarts and across processes. Murmur-style
/// avalanche over the folded tuple.
pub fn flow_fingerprint(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16, proto: u8) -> u32 {
    let mut h = src_ip ^ dst_ip.rotate_left(16) ^ u32::from(proto);
    h = h.wrapping_add(u32::from(src_port) | (u32::from(dst_port) << 16));
    h ^= h >> 16;
    h = h.wrapping_mul(0x85EB_CA6B);
    h ^= h >> 13;
    h = h.wrapping_mul(0xC2B2_AE35);
    h ^= h >> 16;
    h
}
