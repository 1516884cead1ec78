//! Length-prefixed binary framing reserved for the file channel:
//! `opcode (u8) | header_len (u16 BE) | UTF-8 JSON header | raw data`.
//!
//! The live protocol moves upload/download payloads as raw binary frames, so
//! nothing on the wire uses this today; the codec is kept ready for the framed
//! variant of the protocol.

use serde_json::{Map, Value};

/// Decoded form of a framed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Framed {
    pub opcode: u8,
    pub header: Map<String, Value>,
    pub data: Vec<u8>,
}

pub fn pack(opcode: u8, header: Option<&Map<String, Value>>, data: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(opcode);
    if let Some(h) = header {
        let bin_header = serde_json::to_vec(h).unwrap_or_default();
        let len = bin_header.len().min(u16::MAX as usize) as u16;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&bin_header[..len as usize]);
    }
    if let Some(d) = data {
        out.extend_from_slice(d);
    }
    out
}

/// Decode a framed message. Truncated input degrades instead of failing:
/// missing opcode yields zero, a missing header yields an empty map; only a
/// header that is present but not valid JSON is an error.
pub fn unpack(data: &[u8]) -> anyhow::Result<Framed> {
    if data.is_empty() {
        return Ok(Framed { opcode: 0, header: Map::new(), data: Vec::new() });
    }
    let opcode = data[0];
    if data.len() < 3 {
        return Ok(Framed { opcode, header: Map::new(), data: Vec::new() });
    }
    let header_len = u16::from_be_bytes([data[1], data[2]]) as usize;
    let header_end = (3 + header_len).min(data.len());
    let header: Map<String, Value> = serde_json::from_slice(&data[3..header_end])?;
    Ok(Framed { opcode, header, data: data[header_end..].to_vec() })
}
