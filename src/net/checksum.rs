//! Internet checksum (RFC 1071)
//!
//! One's complement sum of 16-bit big-endian words with end-around carry.
//! Odd-length ranges are padded with a zero byte. Compute functions write
//! the checksum field in place; verify functions re-sum the range with the
//! transmitted checksum included and expect all ones.

use core::net::Ipv4Addr;

use super::ipv4::protocol;

/// Offset of the checksum field inside each header
const IPV4_CHECKSUM_OFFSET: usize = 10;
const ICMP_CHECKSUM_OFFSET: usize = 2;
const UDP_CHECKSUM_OFFSET: usize = 6;

/// Add `data` as 16-bit words onto a running 32-bit sum
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        // Fold early so long frames cannot overflow the accumulator
        if sum > 0xFFFF_0000 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    sum
}

/// Fold 32-bit sum to 16 bits
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Internet checksum over an arbitrary byte range
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data, 0))
}

fn store(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Fill in the header checksum of a 20-byte IPv4 header
pub fn compute_ipv4(header: &mut [u8]) {
    store(header, IPV4_CHECKSUM_OFFSET, 0);
    let sum = checksum(header);
    store(header, IPV4_CHECKSUM_OFFSET, sum);
}

/// The IPv4 checksum covers the header only
pub fn verify_ipv4(header: &[u8]) -> bool {
    checksum(header) == 0
}

/// Fill in the checksum of an ICMP message (header and data)
pub fn compute_icmp(message: &mut [u8]) {
    store(message, ICMP_CHECKSUM_OFFSET, 0);
    let sum = checksum(message);
    store(message, ICMP_CHECKSUM_OFFSET, sum);
}

pub fn verify_icmp(message: &[u8]) -> bool {
    checksum(message) == 0
}

/// Sum of the UDP pseudo-header
///
/// The UDP length goes in here and is summed again from the real header
/// when the datagram itself is added; compute and verify both do this.
fn udp_pseudo_sum(src: Ipv4Addr, dst: Ipv4Addr, udp_len: usize) -> u32 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum += protocol::UDP as u32;
    sum += udp_len as u32;
    sum
}

/// Fill in the checksum of a UDP datagram (header and payload)
///
/// A result of zero is transmitted as 0xFFFF; zero on the wire means the
/// sender did not compute one (RFC 768).
pub fn compute_udp(src: Ipv4Addr, dst: Ipv4Addr, datagram: &mut [u8]) {
    store(datagram, UDP_CHECKSUM_OFFSET, 0);
    let sum = sum_words(datagram, udp_pseudo_sum(src, dst, datagram.len()));
    let mut value = !fold(sum);
    if value == 0 {
        value = 0xFFFF;
    }
    store(datagram, UDP_CHECKSUM_OFFSET, value);
}

/// Accepts a correct checksum or a zero field
pub fn verify_udp(src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> bool {
    if datagram.len() < UDP_CHECKSUM_OFFSET + 2 {
        return false;
    }
    let field = u16::from_be_bytes([
        datagram[UDP_CHECKSUM_OFFSET],
        datagram[UDP_CHECKSUM_OFFSET + 1],
    ]);
    if field == 0 {
        return true;
    }
    let sum = sum_words(datagram, udp_pseudo_sum(src, dst, datagram.len()));
    !fold(sum) == 0
}
