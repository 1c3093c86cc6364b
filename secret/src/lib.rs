//! Secret material for the registry: redacted credentials and the
//! irreversible password hashes stored in place of them.

use std::{borrow::Cow, fmt, ops::Deref};

use http::{header::InvalidHeaderValue, HeaderValue};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

mod password;

pub use password::{PasswordError, PasswordHash};

/// A credential such as a user password or a token-signing key.
///
/// The value never appears in `Debug` output and is zeroed when dropped.
/// Use [Secret::revealed] to get the underlying value.
#[derive(Clone, Deserialize, Serialize)]
#[serde(from = "String")]
pub struct Secret(Cow<'static, str>);

impl Secret {
    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }

    /// Raw bytes of the secret, for keying a MAC.
    pub fn as_bytes(&self) -> &[u8] {
        self.revealed().as_bytes()
    }

    /// True when the secret holds no characters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Format the secret as a sensitive `Authorization: Bearer` header value.
    pub fn bearer(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut header = HeaderValue::try_from(format!("Bearer {}", self.revealed()))?;
        header.set_sensitive(true);
        Ok(header)
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secret_hidden_debug() {
        let key = "s3cr3t";
        let secret = Secret::from(key);

        assert!(!format!("{secret:?}").contains("s3cr3t"));
        assert_eq!(&format!("{secret:?}"), "Secret(****)");
        assert_eq!(secret.revealed(), key);
    }

    #[test]
    fn bearer_header_is_sensitive() {
        let token = Secret::from("abc.def.ghi");
        let header = token.bearer().unwrap();
        assert!(header.is_sensitive());
        assert_eq!(header.to_str().unwrap(), "Bearer abc.def.ghi");
    }

    #[test]
    fn deserialize_from_plain_string() {
        let secret: Secret = serde_json::from_str("\"hunter2\"").unwrap();
        assert_eq!(secret.revealed(), "hunter2");
    }
}
