use thiserror::Error;

mod block;
mod number;

pub use block::*;
pub use number::*;

#[derive(Debug, Error)]
pub enum OptionError {
    #[error("Invalid block size exponent ({0})")]
    InvalidBlockSzx(u8),

    #[error("Invalid block number ({0})")]
    InvalidBlockNum(u32),

    #[error("Invalid length for a numeric option value ({0})")]
    InvalidUintLength(usize),
}

/// Encode an unsigned option value in the minimum number of big-endian
/// bytes; zero encodes as the empty value. Values beyond the 4-byte uint
/// range fall back to the 8-byte IEEE-754 double representation, a
/// compatibility escape some peers of the original stack expect.
pub fn encode_uint(value: u64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    if value > u64::from(u32::MAX) {
        return (value as f64).to_be_bytes().to_vec();
    }

    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decode an unsigned option value: up to 4 big-endian bytes, or 8 bytes
/// holding a double (the encoder's escape for outsized values).
pub fn decode_uint(value: &[u8]) -> Result<u64, OptionError> {
    match value.len() {
        0 => Ok(0),
        1..=4 => {
            let mut out = 0u64;
            for byte in value {
                out = out << 8 | u64::from(*byte);
            }
            Ok(out)
        }
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(value);
            Ok(f64::from_be_bytes(bytes) as u64)
        }
        len => Err(OptionError::InvalidUintLength(len)),
    }
}
