//! Connection secrets.
//!
//! A secret is 32 random bytes hex-encoded to 64 characters. It is generated
//! by the client side on construction and acts as the connection's stable
//! identity across transport reconnects.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of random bytes in a secret.
pub const SECRET_BYTES: usize = 32;

/// Header key under which the secret is installed on the peer.
pub const SECRET_HEADER_KEY: &str = "secret";

/// An opaque reconnect identity token.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionSecret(String);

impl ConnectionSecret {
    /// Generate a fresh secret from the thread RNG.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; SECRET_BYTES] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    /// Wrap an existing hex token (e.g. from a `connsecret` query param).
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The hex form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Secrets identify connections in logs but must not leak whole; show a prefix.
impl fmt::Debug for ConnectionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = &self.0[..self.0.len().min(8)];
        write!(f, "ConnectionSecret({prefix}…)")
    }
}
