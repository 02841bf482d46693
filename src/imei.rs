//! # Device IMEI
//!
//! A 15-digit IMEI is held as 8 bytes of packed BCD: a leading zero nibble
//! followed by the 15 digits.
//!
//! Devices announce themselves with one of two handshake units:
//!
//! ```text
//! 00 0F 33 35 36 ... 33     u16 length (15) + 15 ASCII digits
//! 03 56 30 70 42 44 10 13   8-byte BCD
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{GatewayError, Result};

/// Number of digits in an IMEI
pub const IMEI_DIGITS: usize = 15;

/// Size of the BCD encoding
pub const IMEI_BCD_SIZE: usize = 8;

/// Size of the ASCII handshake unit (length prefix + digits)
pub const IMEI_HANDSHAKE_SIZE: usize = 2 + IMEI_DIGITS;

/// Device identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Imei([u8; IMEI_BCD_SIZE]);

impl Imei {
    /// Parse a 15-digit numeric string
    ///
    /// # Errors
    ///
    /// Returns `MalformedImei` if the input is not exactly 15 ASCII digits
    pub fn parse(digits: &str) -> Result<Self> {
        let bytes = digits.as_bytes();
        if bytes.len() != IMEI_DIGITS || !bytes.iter().all(u8::is_ascii_digit) {
            return Err(GatewayError::MalformedImei(format!(
                "IMEI must be a 15-digit numeric string, got {:?}",
                digits
            )));
        }

        // Left-pad with one zero nibble to 16 nibbles
        let mut bcd = [0u8; IMEI_BCD_SIZE];
        for (i, digit) in std::iter::once(0u8).chain(bytes.iter().map(|b| b - b'0')).enumerate() {
            bcd[i / 2] |= if i % 2 == 0 { digit << 4 } else { digit };
        }

        Ok(Self(bcd))
    }

    /// Decode the 8-byte BCD form
    ///
    /// # Errors
    ///
    /// Returns `MalformedImei` if the length is wrong, the leading nibble is
    /// not zero, or any nibble is not a decimal digit
    pub fn from_bcd(bytes: &[u8]) -> Result<Self> {
        let bcd: [u8; IMEI_BCD_SIZE] = bytes.try_into().map_err(|_| {
            GatewayError::MalformedImei(format!("BCD IMEI must be 8 bytes, got {}", bytes.len()))
        })?;

        if bcd[0] >> 4 != 0 {
            return Err(GatewayError::MalformedImei(format!(
                "BCD IMEI must start with a zero nibble: {}",
                hex::encode(bcd)
            )));
        }
        if bcd.iter().any(|b| b >> 4 > 9 || b & 0x0F > 9) {
            return Err(GatewayError::MalformedImei(format!(
                "BCD IMEI contains non-decimal nibbles: {}",
                hex::encode(bcd)
            )));
        }

        Ok(Self(bcd))
    }

    /// Decode the first inbound unit of a connection
    ///
    /// Accepts `[u16 length = 15][15 ASCII digits]` or the 8-byte BCD form.
    pub fn from_handshake(unit: &[u8]) -> Result<Self> {
        match unit.len() {
            IMEI_HANDSHAKE_SIZE => {
                let announced = u16::from_be_bytes([unit[0], unit[1]]) as usize;
                if announced != IMEI_DIGITS {
                    return Err(GatewayError::MalformedImei(format!(
                        "handshake announces {} digits",
                        announced
                    )));
                }
                let digits = std::str::from_utf8(&unit[2..]).map_err(|_| {
                    GatewayError::MalformedImei("handshake digits are not ASCII".to_string())
                })?;
                Self::parse(digits)
            }
            IMEI_BCD_SIZE => Self::from_bcd(unit),
            other => Err(GatewayError::MalformedImei(format!(
                "handshake unit of {} bytes: {}",
                other,
                hex::encode(unit)
            ))),
        }
    }

    /// 8-byte BCD encoding
    pub fn to_bcd(&self) -> [u8; IMEI_BCD_SIZE] {
        self.0
    }

    /// ASCII handshake unit as sent by devices
    pub fn to_handshake(&self) -> Vec<u8> {
        let digits = self.to_string();
        let mut unit = Vec::with_capacity(IMEI_HANDSHAKE_SIZE);
        unit.extend_from_slice(&(IMEI_DIGITS as u16).to_be_bytes());
        unit.extend_from_slice(digits.as_bytes());
        unit
    }
}

impl fmt::Display for Imei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Skip the padding nibble
        let encoded = hex::encode(self.0);
        f.write_str(&encoded[1..])
    }
}

impl fmt::Debug for Imei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Imei({})", self)
    }
}

impl FromStr for Imei {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Imei {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Encode a 15-digit IMEI string as 8-byte BCD
pub fn encode_imei(digits: &str) -> Result<[u8; IMEI_BCD_SIZE]> {
    Imei::parse(digits).map(|imei| imei.to_bcd())
}

/// Decode an 8-byte BCD IMEI to its 15-digit string
pub fn decode_imei(bcd: &[u8]) -> Result<String> {
    Imei::from_bcd(bcd).map(|imei| imei.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "356307042441013";

    #[test]
    fn test_encode_known_value() {
        assert_eq!(
            encode_imei(SAMPLE).unwrap(),
            [0x03, 0x56, 0x30, 0x70, 0x42, 0x44, 0x10, 0x13]
        );
    }

    #[test]
    fn test_round_trip() {
        for digits in [SAMPLE, "000000000000000", "999999999999999", "123456789012345"] {
            let bcd = encode_imei(digits).unwrap();
            assert_eq!(decode_imei(&bcd).unwrap(), digits);
        }
    }

    #[test]
    fn test_rejects_wrong_length_and_non_digits() {
        for bad in ["", "12345", "3563070424410130", "35630704244101a", "35630704244101 ", "３５６３０７０４２４４１０１"] {
            match Imei::parse(bad) {
                Err(GatewayError::MalformedImei(_)) => {}
                other => panic!("Expected MalformedImei for {:?}, got: {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_bcd_validation() {
        assert!(Imei::from_bcd(&[0x13, 0x56, 0x30, 0x70, 0x42, 0x44, 0x10, 0x13]).is_err());
        assert!(Imei::from_bcd(&[0x03, 0x5A, 0x30, 0x70, 0x42, 0x44, 0x10, 0x13]).is_err());
        assert!(Imei::from_bcd(&[0x03, 0x56]).is_err());
    }

    #[test]
    fn test_ascii_handshake() {
        let imei = Imei::parse(SAMPLE).unwrap();
        let unit = imei.to_handshake();
        assert_eq!(&unit[..2], &[0x00, 0x0F]);
        assert_eq!(Imei::from_handshake(&unit).unwrap(), imei);
    }

    #[test]
    fn test_bcd_handshake() {
        let imei = Imei::parse(SAMPLE).unwrap();
        assert_eq!(Imei::from_handshake(&imei.to_bcd()).unwrap(), imei);
    }

    #[test]
    fn test_handshake_rejects_garbage() {
        assert!(Imei::from_handshake(b"hello").is_err());

        let mut unit = Imei::parse(SAMPLE).unwrap().to_handshake();
        unit[1] = 0x0E;
        assert!(Imei::from_handshake(&unit).is_err());
    }

    #[test]
    fn test_display_and_serialize() {
        let imei: Imei = SAMPLE.parse().unwrap();
        assert_eq!(imei.to_string(), SAMPLE);
        assert_eq!(serde_json::to_string(&imei).unwrap(), format!("\"{}\"", SAMPLE));
    }
}
