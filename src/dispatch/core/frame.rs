//! MC protocol 3E binary frame: request build and response parse.
//!
//! Pure functions only; socket handling lives in `adapters::plc::mc_client`.
//!
//! Request layout (little-endian multi-byte fields):
//! `50 00 | net | pc | io(2) | station | len(2) | timer(2) | body`
//! where `len` counts `timer + body`.
//!
//! Response layout:
//! `D0 00 | net | pc | io(2) | station | len(2) | end code(2) | data`
//! where `len` counts `end code + data`.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::device::DeviceAddress;

pub const REQUEST_SUBHEADER: [u8; 2] = [0x50, 0x00];
pub const RESPONSE_SUBHEADER: [u8; 2] = [0xD0, 0x00];

/// Bytes before the request body: subheader..monitor timer.
pub const REQUEST_HEADER_LEN: usize = 11;
/// Bytes before the response data: subheader..end code.
pub const RESPONSE_HEADER_LEN: usize = 11;

pub const CMD_BATCH_READ: u16 = 0x0401;
pub const CMD_BATCH_WRITE: u16 = 0x1401;
pub const SUB_WORD: u16 = 0x0000;
pub const SUB_BIT: u16 = 0x0001;

/// Points per batch request accepted by Q/L series CPUs.
pub const MAX_WORDS_PER_REQUEST: u16 = 960;
pub const MAX_BITS_PER_REQUEST: u16 = 7168;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad response subheader: {0:02X?}")]
    BadSubheader([u8; 2]),

    #[error("truncated frame: expected {expected} bytes got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("completion code 0x{0:04X}")]
    Completion(u16),

    #[error("invalid point count {count} (max {max})")]
    InvalidCount { count: usize, max: u16 },

    #[error("response data length mismatch: expected {expected} got {got}")]
    DataLength { expected: usize, got: usize },
}

/// Routing fields copied into every request header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameRoute {
    pub network_no: u8,
    pub station_no: u8,
    pub module_io: u16,
    pub module_station: u8,
    /// CPU monitoring timer in 250 ms units.
    pub monitor_timer: u16,
}

impl Default for FrameRoute {
    fn default() -> Self {
        Self {
            network_no: 0x00,
            station_no: 0xFF,
            module_io: 0x03FF,
            module_station: 0x00,
            monitor_timer: 0x0010,
        }
    }
}

/// Parsed response header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    pub network_no: u8,
    pub station_no: u8,
    pub module_io: u16,
    pub module_station: u8,
    /// Byte count of end code plus data.
    pub data_len: u16,
    pub end_code: u16,
}

impl ResponseHeader {
    /// Number of data bytes that follow the header.
    pub fn payload_len(&self) -> usize {
        usize::from(self.data_len).saturating_sub(2)
    }
}

fn frame(route: &FrameRoute, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(REQUEST_HEADER_LEN + body.len());
    out.extend_from_slice(&REQUEST_SUBHEADER);
    out.push(route.network_no);
    out.push(route.station_no);
    // Vec<u8> writes are infallible.
    let _ = out.write_u16::<LittleEndian>(route.module_io);
    out.push(route.module_station);
    let _ = out.write_u16::<LittleEndian>((body.len() + 2) as u16);
    let _ = out.write_u16::<LittleEndian>(route.monitor_timer);
    out.extend_from_slice(body);
    out
}

fn command_head(command: u16, sub_command: u16, head: DeviceAddress, count: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(10);
    let _ = body.write_u16::<LittleEndian>(command);
    let _ = body.write_u16::<LittleEndian>(sub_command);
    let _ = body.write_u24::<LittleEndian>(head.number);
    body.push(head.code.code_byte());
    let _ = body.write_u16::<LittleEndian>(count);
    body
}

fn check_count(count: usize, max: u16) -> Result<u16, FrameError> {
    if count == 0 || count > usize::from(max) {
        return Err(FrameError::InvalidCount { count, max });
    }
    Ok(count as u16)
}

pub fn encode_read_words(
    route: &FrameRoute,
    head: DeviceAddress,
    count: usize,
) -> Result<Vec<u8>, FrameError> {
    let count = check_count(count, MAX_WORDS_PER_REQUEST)?;
    Ok(frame(route, &command_head(CMD_BATCH_READ, SUB_WORD, head, count)))
}

pub fn encode_write_words(
    route: &FrameRoute,
    head: DeviceAddress,
    words: &[u16],
) -> Result<Vec<u8>, FrameError> {
    let count = check_count(words.len(), MAX_WORDS_PER_REQUEST)?;
    let mut body = command_head(CMD_BATCH_WRITE, SUB_WORD, head, count);
    for word in words {
        let _ = body.write_u16::<LittleEndian>(*word);
    }
    Ok(frame(route, &body))
}

pub fn encode_read_bits(
    route: &FrameRoute,
    head: DeviceAddress,
    count: usize,
) -> Result<Vec<u8>, FrameError> {
    let count = check_count(count, MAX_BITS_PER_REQUEST)?;
    Ok(frame(route, &command_head(CMD_BATCH_READ, SUB_BIT, head, count)))
}

pub fn encode_write_bits(
    route: &FrameRoute,
    head: DeviceAddress,
    bits: &[bool],
) -> Result<Vec<u8>, FrameError> {
    let count = check_count(bits.len(), MAX_BITS_PER_REQUEST)?;
    let mut body = command_head(CMD_BATCH_WRITE, SUB_BIT, head, count);
    body.extend_from_slice(&pack_bits(bits));
    Ok(frame(route, &body))
}

/// Two points per byte, first point in the high nibble.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(2)
        .map(|pair| {
            let hi = if pair[0] { 0x10 } else { 0x00 };
            let lo = if pair.get(1).copied().unwrap_or(false) {
                0x01
            } else {
                0x00
            };
            hi | lo
        })
        .collect()
}

pub fn unpack_bits(data: &[u8], count: usize) -> Result<Vec<bool>, FrameError> {
    let expected = count.div_ceil(2);
    if data.len() != expected {
        return Err(FrameError::DataLength {
            expected,
            got: data.len(),
        });
    }
    Ok(data
        .iter()
        .flat_map(|b| [(b & 0x10) != 0, (b & 0x01) != 0])
        .take(count)
        .collect())
}

pub fn parse_response_header(bytes: &[u8]) -> Result<ResponseHeader, FrameError> {
    if bytes.len() < RESPONSE_HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: RESPONSE_HEADER_LEN,
            got: bytes.len(),
        });
    }
    let subheader = [bytes[0], bytes[1]];
    if subheader != RESPONSE_SUBHEADER {
        return Err(FrameError::BadSubheader(subheader));
    }

    let mut cur = Cursor::new(&bytes[2..RESPONSE_HEADER_LEN]);
    let truncated = |_: std::io::Error| FrameError::Truncated {
        expected: RESPONSE_HEADER_LEN,
        got: bytes.len(),
    };
    let network_no = cur.read_u8().map_err(truncated)?;
    let station_no = cur.read_u8().map_err(truncated)?;
    let module_io = cur.read_u16::<LittleEndian>().map_err(truncated)?;
    let module_station = cur.read_u8().map_err(truncated)?;
    let data_len = cur.read_u16::<LittleEndian>().map_err(truncated)?;
    let end_code = cur.read_u16::<LittleEndian>().map_err(truncated)?;

    Ok(ResponseHeader {
        network_no,
        station_no,
        module_io,
        module_station,
        data_len,
        end_code,
    })
}

/// Validates a complete response frame and returns its data bytes.
///
/// A non-zero end code is reported as `FrameError::Completion` even when the
/// frame carries error detail bytes.
pub fn parse_response(bytes: &[u8]) -> Result<&[u8], FrameError> {
    let header = parse_response_header(bytes)?;
    if header.end_code != 0 {
        return Err(FrameError::Completion(header.end_code));
    }
    let expected = RESPONSE_HEADER_LEN + header.payload_len();
    if bytes.len() < expected {
        return Err(FrameError::Truncated {
            expected,
            got: bytes.len(),
        });
    }
    Ok(&bytes[RESPONSE_HEADER_LEN..expected])
}

pub fn decode_words(data: &[u8], count: usize) -> Result<Vec<u16>, FrameError> {
    if data.len() != count * 2 {
        return Err(FrameError::DataLength {
            expected: count * 2,
            got: data.len(),
        });
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// `words` words as `2 * words` ASCII bytes, low byte first; space/NUL padding trimmed.
pub fn words_to_string(words: &[u16]) -> String {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let text = String::from_utf8_lossy(&bytes);
    text.trim_end_matches(['\0', ' ']).to_string()
}

/// Pads (or truncates) `text` to exactly `words * 2` bytes.
///
/// The first pad byte is a NUL terminator and the remainder are spaces.
pub fn string_to_words(text: &str, words: usize) -> Vec<u16> {
    let capacity = words * 2;
    let mut bytes: Vec<u8> = text.bytes().take(capacity).collect();
    if bytes.len() < capacity {
        bytes.push(0);
    }
    bytes.resize(capacity, b' ');
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Two words as low/high halves of a signed 32-bit value.
pub fn words_to_i32(words: &[u16]) -> Option<i32> {
    match words {
        [low, high, ..] => Some(((u32::from(*high) << 16) | u32::from(*low)) as i32),
        _ => None,
    }
}

pub fn i32_to_words(value: i32) -> [u16; 2] {
    let raw = value as u32;
    [(raw & 0xFFFF) as u16, (raw >> 16) as u16]
}
