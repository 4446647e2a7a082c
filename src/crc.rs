//! CRC-16/CCITT as computed by the eZ8 debug hardware.
//!
//! Reflected polynomial `0x8408` (x^16 + x^12 + x^5 + 1), conventionally
//! seeded with `0xFFFF`. No final inversion is applied here: the raw
//! running value is what the device-side memory CRC command reports, so it
//! is what all cache comparisons use. Display code inverts with
//! `!crc & 0xffff` if it wants the standard presentation.

use once_cell::sync::Lazy;

const POLYNOMIAL: u16 = 0x8408;

static TABLE: Lazy<[u16; 256]> = Lazy::new(|| {
    let mut table = [0u16; 256];
    for (value, entry) in table.iter_mut().enumerate() {
        let mut crc = value as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
        }
        *entry = crc;
    }
    table
});

/// Continues a running CRC over `data`, starting from `seed`.
///
/// An empty buffer returns the seed unchanged, so the CRC of a large image
/// can be computed piecewise by threading the return value back in as the
/// seed of the next call.
pub fn crc16_ccitt(seed: u16, data: &[u8]) -> u16 {
    data.iter().fold(seed, |crc, &byte| {
        (crc >> 8) ^ TABLE[usize::from((crc ^ u16::from(byte)) & 0xff)]
    })
}

#[cfg(test)]
mod tests {
    use super::crc16_ccitt;

    #[test]
    fn empty_buffer_returns_seed() {
        assert_eq!(crc16_ccitt(0xFFFF, &[]), 0xFFFF);
        assert_eq!(crc16_ccitt(0x1234, &[]), 0x1234);
    }

    #[test]
    fn golden_vectors() {
        assert_eq!(crc16_ccitt(0xFFFF, &[0x00]), 0x0F87);
        assert_eq!(crc16_ccitt(0xFFFF, b"123456789"), 0x6F91);
        assert_eq!(crc16_ccitt(0xFFFF, &[0xDE, 0xAD]), 0x4B7C);
        assert_eq!(crc16_ccitt(0x0000, b"abc"), 0x58E9);
    }

    #[test]
    fn piecewise_equals_whole() {
        let data = b"the quick brown fox";
        let whole = crc16_ccitt(0xFFFF, data);
        let (head, tail) = data.split_at(7);
        let piecewise = crc16_ccitt(crc16_ccitt(0xFFFF, head), tail);
        assert_eq!(whole, piecewise);
    }

    #[test]
    fn blank_page_vector() {
        // 2 KiB of erased flash, as used by the shadow-cache comparisons.
        let blank = vec![0xFFu8; 0x800];
        assert_eq!(crc16_ccitt(0x0000, &blank), 0xCA6F);
    }
}
