//! API credentials passed explicitly into every outbound call.
//!
//! A `Credential` never prints its secret: `Debug` and `preview()` only show
//! the first few characters.

use std::fmt;

const PREVIEW_CHARS: usize = 4;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw secret, for placing into an outbound header.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Redacted form suitable for logs.
    pub fn preview(&self) -> String {
        let shown: String = self.0.chars().take(PREVIEW_CHARS).collect();
        if self.0.chars().count() > PREVIEW_CHARS {
            format!("{shown}…")
        } else {
            "…".to_string()
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.preview()).finish()
    }
}

impl From<String> for Credential {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for Credential {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_secret() {
        let cred = Credential::new("sk-very-secret-key");
        let printed = format!("{cred:?}");
        assert!(!printed.contains("secret"));
        assert!(printed.contains("sk-v"));
    }

    #[test]
    fn short_keys_are_fully_hidden() {
        assert_eq!(Credential::new("abc").preview(), "…");
    }

    #[test]
    fn blank_credential_is_empty() {
        assert!(Credential::new("   ").is_empty());
        assert!(!Credential::new("k").is_empty());
    }
}
