use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};

/// Number of random bytes behind every identifier.
pub const IDENTIFIER_BYTES: usize = 32;

/// Encoded length of an identifier (32 bytes, unpadded base64).
pub const IDENTIFIER_LEN: usize = 43;

/// Random, URL and path safe name of a stored asset.
///
/// Uniqueness is probabilistic: 256 bits of entropy and no lookup against
/// existing storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetIdentifier(String);

impl AssetIdentifier {
    /// Mints a fresh identifier from the operating system's CSPRNG.
    ///
    /// Panics if the random source is unavailable; there is no sane way to
    /// continue handing out names without it.
    pub fn generate() -> Self {
        Self::from_rng(&mut OsRng)
    }

    pub fn from_rng<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut base = [0u8; IDENTIFIER_BYTES];
        rng.fill_bytes(&mut base);
        Self::from_bytes(base)
    }

    pub fn from_bytes(bytes: [u8; IDENTIFIER_BYTES]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Accepts an already minted identifier, e.g. one read back from a key.
impl TryFrom<&str> for AssetIdentifier {
    type Error = InvalidIdentifier;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if !value.is_empty()
            && value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            Ok(Self(value.to_string()))
        } else {
            Err(InvalidIdentifier(value.to_string()))
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid asset identifier {0:?}")]
pub struct InvalidIdentifier(String);

impl fmt::Display for AssetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn url_safe(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '-' || c == '_'
    }

    #[test]
    fn generated_identifier_shape() {
        for _ in 0..64 {
            let id = AssetIdentifier::generate();
            assert_eq!(id.as_str().len(), IDENTIFIER_LEN);
            assert!(id.as_str().chars().all(url_safe), "{id}");
            assert!(!id.as_str().contains('='));
        }
    }

    #[test]
    fn deterministic_with_mocked_rng() {
        let a = AssetIdentifier::from_rng(&mut StepRng::new(0, 1));
        let b = AssetIdentifier::from_rng(&mut StepRng::new(0, 1));
        let c = AssetIdentifier::from_rng(&mut StepRng::new(7, 3));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn accepts_only_url_safe_text() {
        assert_eq!(AssetIdentifier::try_from("abc123").unwrap().as_str(), "abc123");
        assert!(AssetIdentifier::try_from("a-b_C9").is_ok());
        assert!(AssetIdentifier::try_from("").is_err());
        assert!(AssetIdentifier::try_from("../etc").is_err());
        assert!(AssetIdentifier::try_from("a+b/c=").is_err());
    }

    #[test]
    fn encodes_known_bytes() {
        let id = AssetIdentifier::from_bytes([0xff; IDENTIFIER_BYTES]);
        assert_eq!(id.as_str(), "_".repeat(42) + "8");
        let id = AssetIdentifier::from_bytes([0; IDENTIFIER_BYTES]);
        assert_eq!(id.as_str(), "A".repeat(IDENTIFIER_LEN));
    }
}
