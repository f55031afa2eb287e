//! MC protocol device table and typed device addresses.
//!
//! Device codes are resolved when an address is built (`DeviceAddress::parse`),
//! so an unknown code is a configuration error and never reaches the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest head device number the 3-byte address field can carry.
pub const MAX_DEVICE_NUMBER: u32 = 0x00FF_FFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceCode {
    SM,
    SD,
    X,
    Y,
    M,
    L,
    F,
    V,
    B,
    D,
    W,
    TS,
    TC,
    TN,
    SS,
    SC,
    SN,
    CS,
    CC,
    CN,
    SB,
    SW,
    DX,
    DY,
    R,
    ZR,
}

const DEVICE_TABLE: &[(DeviceCode, &str, u8)] = &[
    (DeviceCode::SM, "SM", 0x91),
    (DeviceCode::SD, "SD", 0xA9),
    (DeviceCode::X, "X", 0x9C),
    (DeviceCode::Y, "Y", 0x9D),
    (DeviceCode::M, "M", 0x90),
    (DeviceCode::L, "L", 0x92),
    (DeviceCode::F, "F", 0x93),
    (DeviceCode::V, "V", 0x94),
    (DeviceCode::B, "B", 0xA0),
    (DeviceCode::D, "D", 0xA8),
    (DeviceCode::W, "W", 0xB4),
    (DeviceCode::TS, "TS", 0xC1),
    (DeviceCode::TC, "TC", 0xC0),
    (DeviceCode::TN, "TN", 0xC2),
    (DeviceCode::SS, "SS", 0xC7),
    (DeviceCode::SC, "SC", 0xC6),
    (DeviceCode::SN, "SN", 0xC8),
    (DeviceCode::CS, "CS", 0xC4),
    (DeviceCode::CC, "CC", 0xC3),
    (DeviceCode::CN, "CN", 0xC5),
    (DeviceCode::SB, "SB", 0xA1),
    (DeviceCode::SW, "SW", 0xB5),
    (DeviceCode::DX, "DX", 0xA2),
    (DeviceCode::DY, "DY", 0xA3),
    (DeviceCode::R, "R", 0xAF),
    (DeviceCode::ZR, "ZR", 0xB0),
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("unknown device code: {0}")]
    UnknownCode(String),

    #[error("invalid device number: {0}")]
    InvalidNumber(String),

    #[error("device number out of range: {0}")]
    OutOfRange(u32),
}

impl DeviceCode {
    /// Binary code byte sent in the request body.
    pub fn code_byte(self) -> u8 {
        DEVICE_TABLE
            .iter()
            .find(|(code, _, _)| *code == self)
            .map(|(_, _, byte)| *byte)
            .unwrap_or(0)
    }

    pub fn symbol(self) -> &'static str {
        DEVICE_TABLE
            .iter()
            .find(|(code, _, _)| *code == self)
            .map(|(_, symbol, _)| *symbol)
            .unwrap_or("?")
    }

    /// X/Y/B/W-style devices number their points in hexadecimal.
    pub fn is_hex_numbered(self) -> bool {
        matches!(
            self,
            DeviceCode::X
                | DeviceCode::Y
                | DeviceCode::B
                | DeviceCode::W
                | DeviceCode::SB
                | DeviceCode::SW
                | DeviceCode::DX
                | DeviceCode::DY
        )
    }
}

impl FromStr for DeviceCode {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        DEVICE_TABLE
            .iter()
            .find(|(_, symbol, _)| *symbol == upper)
            .map(|(code, _, _)| *code)
            .ok_or(DeviceError::UnknownCode(upper))
    }
}

impl fmt::Display for DeviceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A device code plus head device number, e.g. `D100` or `X1F`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress {
    pub code: DeviceCode,
    pub number: u32,
}

impl DeviceAddress {
    pub fn new(code: DeviceCode, number: u32) -> Result<Self, DeviceError> {
        if number > MAX_DEVICE_NUMBER {
            return Err(DeviceError::OutOfRange(number));
        }
        Ok(Self { code, number })
    }

    pub fn parse(text: &str) -> Result<Self, DeviceError> {
        let text = text.trim();
        let split = text
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(text.len());
        // Hex-numbered devices may start with a letter digit (e.g. "XA0"), so
        // try the longest known prefix first.
        let (code, digits) = match longest_code_prefix(text) {
            Some((code, rest)) => (code, rest),
            None => (DeviceCode::from_str(&text[..split])?, &text[split..]),
        };
        if digits.is_empty() {
            return Err(DeviceError::InvalidNumber(text.to_string()));
        }
        let radix = if code.is_hex_numbered() { 16 } else { 10 };
        let number = u32::from_str_radix(digits, radix)
            .map_err(|_| DeviceError::InvalidNumber(text.to_string()))?;
        Self::new(code, number)
    }

    /// Address `offset` devices further on.
    pub fn offset(self, offset: u32) -> Result<Self, DeviceError> {
        Self::new(self.code, self.number.saturating_add(offset))
    }
}

fn longest_code_prefix(text: &str) -> Option<(DeviceCode, &str)> {
    let upper = text.to_ascii_uppercase();
    let mut best: Option<(DeviceCode, usize)> = None;
    for (code, symbol, _) in DEVICE_TABLE {
        if upper.starts_with(symbol) && best.map_or(true, |(_, len)| symbol.len() > len) {
            let rest = &text[symbol.len()..];
            let radix = if code.is_hex_numbered() { 16 } else { 10 };
            if !rest.is_empty() && rest.chars().all(|c| c.is_digit(radix)) {
                best = Some((*code, symbol.len()));
            }
        }
    }
    best.map(|(code, len)| (code, &text[len..]))
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_hex_numbered() {
            write!(f, "{}{:X}", self.code, self.number)
        } else {
            write!(f, "{}{}", self.code, self.number)
        }
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = DeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceAddress> for String {
    fn from(value: DeviceAddress) -> Self {
        value.to_string()
    }
}
