use std::fmt::Display;

use crate::{
    constants::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE},
    types::option::OptionError,
};

/// Largest representable block number (20 bits).
const MAX_BLOCK_NUM: u32 = (1 << 20) - 1;

/// Decoded value of a Block1 or Block2 option: block number, more-to-come
/// flag and size exponent. The block size is `2^(szx + 4)`, so szx 0 is 16
/// bytes and szx 6 is 1024 bytes.
///
/// On the wire the three fields pack into a 0-3 byte unsigned value
/// `(num << 4) | (m << 3) | szx`.
///
/// See [RFC 7959 - Section 2.2](https://datatracker.ietf.org/doc/html/rfc7959#section-2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl BlockOption {
    pub fn new(num: u32, more: bool, szx: u8) -> Result<Self, OptionError> {
        if szx > 6 {
            return Err(OptionError::InvalidBlockSzx(szx));
        }
        if num > MAX_BLOCK_NUM {
            return Err(OptionError::InvalidBlockNum(num));
        }

        Ok(Self { num, more, szx })
    }

    /// Build a block option from a byte size, converting it to the exponent
    /// form: `szx = log2(size) - 4`, clamped to the representable range
    /// 16..=1024.
    pub fn from_size(num: u32, more: bool, size: usize) -> Result<Self, OptionError> {
        Self::new(num, more, szx_for_size(size))
    }

    /// Block size in bytes.
    pub fn size(&self) -> usize {
        1 << (self.szx + 4)
    }

    /// Byte offset of this block within the full body.
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    /// The packed numeric value carried by the option.
    pub fn value(&self) -> u32 {
        (self.num << 4) | (u32::from(self.more) << 3) | u32::from(self.szx)
    }

    pub fn from_value(value: u64) -> Result<Self, OptionError> {
        let value = u32::try_from(value).map_err(|_| OptionError::InvalidBlockNum(u32::MAX))?;
        let szx = (value & 0x07) as u8;
        if szx > 6 {
            return Err(OptionError::InvalidBlockSzx(szx));
        }

        Ok(Self {
            num: value >> 4,
            more: value & 0x08 != 0,
            szx,
        })
    }
}

/// Size exponent for a byte size, clamped to the representable range.
pub fn szx_for_size(size: usize) -> u8 {
    let size = size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
    // floor(log2(size)) - 4
    (size.ilog2() - 4) as u8
}

impl Display for BlockOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.num,
            if self.more { 1 } else { 0 },
            self.size()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_exponent_mapping() {
        assert_eq!(szx_for_size(16), 0);
        assert_eq!(szx_for_size(64), 2);
        assert_eq!(szx_for_size(512), 5);
        assert_eq!(szx_for_size(1024), 6);
        // Clamped at both ends, and non-powers round down.
        assert_eq!(szx_for_size(8), 0);
        assert_eq!(szx_for_size(4096), 6);
        assert_eq!(szx_for_size(100), 2);
    }

    #[test]
    fn packed_value_round_trip() {
        let block = BlockOption::new(5, true, 2).unwrap();
        assert_eq!(block.value(), (5 << 4) | 0x08 | 2);
        assert_eq!(BlockOption::from_value(block.value().into()).unwrap(), block);
        assert_eq!(block.size(), 64);
        assert_eq!(block.offset(), 320);
    }

    #[test]
    fn zero_value_is_first_block() {
        let block = BlockOption::from_value(0).unwrap();
        assert_eq!(block.num, 0);
        assert!(!block.more);
        assert_eq!(block.size(), 16);
    }

    #[test]
    fn reserved_szx_is_rejected() {
        assert!(BlockOption::from_value(0x07).is_err());
        assert!(BlockOption::new(0, false, 7).is_err());
    }
}
