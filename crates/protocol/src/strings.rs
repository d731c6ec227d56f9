//! String descriptor payloads
//!
//! String descriptors carry UTF-16LE code units after the two byte header.
//! String descriptor zero instead carries the list of supported language ids.

use crate::constants::DESCRIPTOR_HEADER_SIZE;
use crate::error::{DescriptorError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Code units of a string descriptor
///
/// Anything of two bytes or fewer is an empty string. An odd trailing byte is
/// ignored.
pub fn decode_string_descriptor(data: &[u8]) -> Vec<u16> {
    if data.len() <= DESCRIPTOR_HEADER_SIZE {
        return Vec::new();
    }
    data[DESCRIPTOR_HEADER_SIZE..]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect()
}

/// Convert UTF-16 code units to ASCII, replacing anything outside it with `?`
pub fn utf16_to_ascii_lossy(units: &[u16]) -> String {
    units
        .iter()
        .map(|&unit| if unit < 128 { unit as u8 as char } else { '?' })
        .collect()
}

/// Language ids listed in string descriptor zero
pub fn parse_language_ids(data: &[u8]) -> Result<Vec<u16>> {
    if data.len() < DESCRIPTOR_HEADER_SIZE {
        return Err(DescriptorError::NoLanguageIds);
    }
    Ok(decode_string_descriptor(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_string() {
        let bytes = [8, 0x03, b'A', 0, b'b', 0, b'1', 0];
        let units = decode_string_descriptor(&bytes);
        assert_eq!(units, vec![0x41, 0x62, 0x31]);
        assert_eq!(utf16_to_ascii_lossy(&units), "Ab1");
    }

    #[test]
    fn test_header_only_is_empty() {
        assert!(decode_string_descriptor(&[2, 0x03]).is_empty());
        assert!(decode_string_descriptor(&[]).is_empty());
    }

    #[test]
    fn test_non_ascii_replaced() {
        // "é" and a CJK character
        assert_eq!(utf16_to_ascii_lossy(&[0x61, 0x00E9, 0x4E2D, 0x7A]), "a??z");
    }

    #[test]
    fn test_language_ids() {
        let ids = parse_language_ids(&[6, 0x03, 0x09, 0x04, 0x07, 0x04]).unwrap();
        assert_eq!(ids, vec![0x0409, 0x0407]);
        assert_eq!(parse_language_ids(&[2, 0x03]).unwrap(), Vec::<u16>::new());
        assert_eq!(
            parse_language_ids(&[4]).unwrap_err(),
            DescriptorError::NoLanguageIds
        );
    }
}
