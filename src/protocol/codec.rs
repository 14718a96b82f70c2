//! Stateless frame encoding and decoding.
//!
//! # Wire Format
//!
//! ```text
//! ┌───────────┬──────────────┬────────────────┬──────────────────────────┐
//! │ Magic (4) │ Type (4, BE) │ Length (4, BE) │ args joined by NUL bytes │
//! └───────────┴──────────────┴────────────────┴──────────────────────────┘
//! ```
//!
//! The last argument is not NUL-terminated; its end is given by the length
//! field.

use crate::error::{GearError, Result};
use crate::protocol::packet::{Magic, Packet, PacketType};

pub const HEADER_LEN: usize = 12;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: Magic,
    pub packet_type: PacketType,
    pub body_len: usize,
}

/// Encode a packet as one frame.
///
/// # Errors
///
/// Returns `Framing` if the body does not fit the 32-bit length field.
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    let body_len = packet.args.iter().map(Vec::len).sum::<usize>()
        + packet.args.len().saturating_sub(1);
    let length_field = length_field(packet.packet_type, body_len)?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body_len);
    frame.extend_from_slice(&packet.magic.as_bytes());
    frame.extend_from_slice(&packet.packet_type.code().to_be_bytes());
    frame.extend_from_slice(&length_field.to_be_bytes());
    for (i, arg) in packet.args.iter().enumerate() {
        if i > 0 {
            frame.push(0);
        }
        frame.extend_from_slice(arg);
    }
    Ok(frame)
}

fn length_field(packet_type: PacketType, body_len: usize) -> Result<u32> {
    u32::try_from(body_len).map_err(|_| {
        GearError::Framing(format!(
            "{} body of {} bytes does not fit the length field",
            packet_type, body_len
        ))
    })
}

/// Parse a header, rejecting bodies larger than `max_body_len`.
pub fn decode_header(bytes: &[u8; HEADER_LEN], max_body_len: usize) -> Result<Header> {
    let magic = Magic::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    let code = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let packet_type = PacketType::from_code(code)?;
    let body_len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;

    if body_len > max_body_len {
        return Err(GearError::Framing(format!(
            "{} body of {} bytes exceeds limit of {}",
            packet_type, body_len, max_body_len
        )));
    }

    Ok(Header {
        magic,
        packet_type,
        body_len,
    })
}

/// Split a body into the argument list its header's packet type requires.
///
/// Splitting stops after `arg_count - 1` separators so the final argument
/// may itself contain NUL bytes.
pub fn decode_body(header: &Header, body: &[u8]) -> Result<Packet> {
    let expected = header.packet_type.arg_count();
    let args: Vec<Vec<u8>> = body.splitn(expected, |b| *b == 0).map(<[u8]>::to_vec).collect();

    if args.len() != expected {
        return Err(GearError::Framing(format!(
            "{} expects {} arguments, got {}",
            header.packet_type,
            expected,
            args.len()
        )));
    }

    Ok(Packet {
        magic: header.magic,
        packet_type: header.packet_type,
        args,
    })
}

/// Decode one complete frame held in memory.
pub fn decode(frame: &[u8], max_body_len: usize) -> Result<Packet> {
    if frame.len() < HEADER_LEN {
        return Err(GearError::Framing(format!(
            "frame of {} bytes is shorter than the header",
            frame.len()
        )));
    }
    let mut header_bytes = [0u8; HEADER_LEN];
    header_bytes.copy_from_slice(&frame[..HEADER_LEN]);
    let header = decode_header(&header_bytes, max_body_len)?;

    let body = &frame[HEADER_LEN..];
    if body.len() != header.body_len {
        return Err(GearError::Framing(format!(
            "declared length {} but {} body bytes present",
            header.body_len,
            body.len()
        )));
    }
    decode_body(&header, body)
}
