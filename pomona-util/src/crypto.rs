//! Shared access signatures.
//!
//! Both the provisioning service and the hub authenticate devices with a
//! token derived from the enrollment symmetric key:
//!
//! ```text
//! SharedAccessSignature sr=<resource>&sig=<signature>&se=<expiry>[&skn=<key name>]
//! ```
//!
//! where the signature is the base64 encoded HMAC-SHA256 of
//! `<url encoded resource>\n<expiry>` keyed with the base64 decoded key.
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use url::form_urlencoded::byte_serialize;

use crate::types::SymmetricKey;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("symmetric key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),

    #[error("symmetric key cannot be used as a signing key")]
    KeyLength,
}

/// A signed token, ready to be used as an `Authorization` header
#[derive(Clone)]
pub struct SasToken {
    resource: String,
    signature: String,
    expiry: u64,
    key_name: Option<String>,
}

impl SasToken {
    /// Sign `resource` with `key`, valid until `expiry` (unix seconds)
    pub fn sign(
        key: &SymmetricKey,
        resource: &str,
        key_name: Option<&str>,
        expiry: u64,
    ) -> Result<Self, SignatureError> {
        let key = STANDARD.decode(key.expose())?;
        let resource = url_encode(resource);

        let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| SignatureError::KeyLength)?;
        mac.update(format!("{resource}\n{expiry}").as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        Ok(Self {
            resource,
            signature,
            expiry,
            key_name: key_name.map(String::from),
        })
    }

    /// Sign `resource` with a token that expires `ttl` from now
    pub fn sign_for(
        key: &SymmetricKey,
        resource: &str,
        key_name: Option<&str>,
        ttl: Duration,
    ) -> Result<Self, SignatureError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::sign(key, resource, key_name, (now + ttl).as_secs())
    }

    /// Expiry of the token as unix seconds
    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    /// The value to use for the `Authorization` header
    pub fn header_value(&self) -> String {
        let mut value = format!(
            "SharedAccessSignature sr={}&sig={}&se={}",
            self.resource,
            url_encode(&self.signature),
            self.expiry
        );
        if let Some(key_name) = &self.key_name {
            value.push_str("&skn=");
            value.push_str(&url_encode(key_name));
        }
        value
    }
}

impl fmt::Debug for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasToken")
            .field("resource", &self.resource)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

fn url_encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}
