use std::fmt;
use std::str::FromStr;

use crate::error::PgpCacheError;

/// 64-bit OpenPGP key identifier.
///
/// The canonical text form is 16 upper-case hex digits, zero padded. Every
/// secure-cache entry name that refers to a key is built from this form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub u64);

impl KeyId {
    pub const fn new(id: u64) -> Self {
        KeyId(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Low 32 bits as 8 upper-case hex digits (the form shown in prompts).
    pub fn short(self) -> String {
        format!("{:08X}", self.0 as u32)
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        KeyId(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({:016X})", self.0)
    }
}

impl From<u64> for KeyId {
    fn from(id: u64) -> Self {
        KeyId(id)
    }
}

impl FromStr for KeyId {
    type Err = PgpCacheError;

    /// Accepts 1-16 hex digits with an optional `0x` prefix, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.is_empty() || digits.len() > 16 {
            return Err(PgpCacheError::KeyId(format!(
                "{s:?}: expected 1 to 16 hex digits"
            )));
        }
        u64::from_str_radix(digits, 16)
            .map(KeyId)
            .map_err(|e| PgpCacheError::KeyId(format!("{s:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_zero_padded_uppercase() {
        assert_eq!(KeyId(0xddc1e8b734c81449).to_string(), "DDC1E8B734C81449");
        assert_eq!(KeyId(0x1f).to_string(), "000000000000001F");
    }

    #[test]
    fn test_short_form() {
        assert_eq!(KeyId(0x01484C4E214C5F12).short(), "214C5F12");
    }

    #[test]
    fn test_parse() {
        let id: KeyId = "134ffd6abe7b858d".parse().unwrap();
        assert_eq!(id, KeyId(0x134FFD6ABE7B858D));
        let id: KeyId = "0x1F".parse().unwrap();
        assert_eq!(id, KeyId(0x1f));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<KeyId>().is_err());
        assert!("xyz".parse::<KeyId>().is_err());
        assert!("00112233445566778".parse::<KeyId>().is_err());
    }
}
