//! Reversible password obscuring.
//!
//! This hides credentials from shoulder-surfing in config dumps; it is an
//! encoding, not encryption, and round-trips exactly.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use super::ConfigError;

/// Obscure a plain-text password for storage.
pub fn obscure(plain: &str) -> String {
    URL_SAFE_NO_PAD.encode(plain.as_bytes())
}

/// Recover the plain text of an obscured password.
pub fn reveal(obscured: &str) -> Result<String, ConfigError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(obscured)
        .map_err(|err| ConfigError::Obscured(err.to_string()))?;
    String::from_utf8(bytes).map_err(|err| ConfigError::Obscured(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let secret = "hunter2 with spaces / symbols";
        assert_eq!(reveal(&obscure(secret)).unwrap(), secret);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(reveal("!!!"), Err(ConfigError::Obscured(_))));
    }
}
