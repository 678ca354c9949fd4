//! Hex encoding utility
//! Uppercase hex for raw traffic logs

use std::fmt::Write;

/// Encode bytes to space separated uppercase hex, the form used in packet logs
/// Example: [0x02, 0x04, 0x4F] -> "02 04 4F"
pub fn encode_spaced(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        // Writing to String buffer is infallible
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_encode_spaced() {
        assert_eq!(encode_spaced(&[0x02, 0x04, 0x4F, 0x03]), "02 04 4F 03");
        assert_eq!(encode_spaced(&[0x06]), "06");
        assert_eq!(encode_spaced(&[]), "");
    }
}
