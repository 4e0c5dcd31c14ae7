/// USB serial number string derived from the device's 96-bit unique ID.
///
/// The three ID words are summed and the result rendered as eight uppercase hexadecimal digits,
/// most significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialNumber([u8; 8]);

impl SerialNumber {
    pub fn from_unique_id(id: [u32; 3]) -> Self {
        let value = id.iter().fold(0u32, |acc, word| acc.wrapping_add(*word));

        let mut digits = [0; 8];
        for (i, digit) in digits.iter_mut().rev().enumerate() {
            let nibble = ((value >> (4 * i)) & 0xF) as u8;
            *digit = match nibble {
                0..=9 => b'0' + nibble,
                _ => b'A' + nibble - 10,
            };
        }
        Self(digits)
    }

    pub fn as_str(&self) -> &str {
        // only ASCII hex digits are ever stored
        core::str::from_utf8(&self.0).unwrap_or_default()
    }
}
