//! ICMP (Internet Control Message Protocol) - RFC 792

use super::checksum::checksum16;
use super::ipv4;
use crate::{Error, Result};

/// Fixed message header: type, code, checksum, rest-of-header
pub const HEADER_SIZE: usize = 8;

/// ICMP message types handled by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    DestinationUnreachable = 3,
    EchoRequest = 8,
    TimeExceeded = 11,
}

/// Destination unreachable: port unreachable
pub const CODE_PORT_UNREACHABLE: u8 = 3;
/// Time exceeded: TTL expired in transit
pub const CODE_TTL_EXPIRED: u8 = 0;

/// Parsed ICMP message (zero-copy reference)
#[derive(Debug)]
pub struct IcmpMessage<'a> {
    buffer: &'a [u8],
}

impl<'a> IcmpMessage<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("ICMP message too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn icmp_type(&self) -> u8 {
        self.buffer[0]
    }

    pub fn code(&self) -> u8 {
        self.buffer[1]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// For echo request/reply: identifier
    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// For echo request/reply: sequence number
    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

/// Build an echo reply from a received echo request.
///
/// Identifier, sequence, and data are carried over unchanged; only the type
/// and checksum differ.
pub fn build_echo_reply(request: &[u8]) -> Result<Vec<u8>> {
    if request.len() < HEADER_SIZE {
        return Err(Error::Parse("ICMP echo request too short".into()));
    }

    let mut reply = request.to_vec();
    reply[0] = IcmpType::EchoReply as u8;
    reply[1] = 0;
    reply[2] = 0;
    reply[3] = 0;

    let sum = checksum16(&reply);
    reply[2..4].copy_from_slice(&sum.to_be_bytes());
    Ok(reply)
}

/// Build an ICMP error message.
///
/// Embeds the offending packet's IP header plus its first 8 payload bytes,
/// per RFC 792; the rest-of-header (identifier/sequence position) is zero.
pub fn build_error(icmp_type: IcmpType, code: u8, original: &[u8]) -> Vec<u8> {
    let embed_len = original.len().min(ipv4::HEADER_SIZE + 8);

    let mut message = vec![0u8; HEADER_SIZE + embed_len];
    message[0] = icmp_type as u8;
    message[1] = code;
    message[HEADER_SIZE..].copy_from_slice(&original[..embed_len]);

    let sum = checksum16(&message);
    message[2..4].copy_from_slice(&sum.to_be_bytes());
    message
}
