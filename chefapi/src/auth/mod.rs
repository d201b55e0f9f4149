// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Chef server request authentication.
//!
//! The Chef server authenticates API clients with a signed-header scheme (historically
//! implemented by Ruby's `mixlib-authentication`). Each request carries a timestamp, the client
//! name, and a hash of the body in headers; a canonical string built from those values is signed
//! with the client's RSA private key and the base64 signature is spread across
//! `X-Ops-Authorization-N` headers.
//!
//! [`Identity`] holds the client name and key, [`signature`] implements the RSA and header
//! chunking primitives, and [`request`] assembles the canonical string and header set.

use std::{fmt, path::Path, str::FromStr};

use openssl::{
    pkey::{Id, PKey, Private},
    rsa::Rsa,
};
use serde::{Deserialize, Serialize};

use crate::{digest::DigestAlgorithm, error::KeyError};

pub mod request;
pub mod signature;

pub use request::{CanonicalRequest, RequestSigner};

/// The version of the authentication protocol used to sign requests.
///
/// The server reads the version from the `X-Ops-Sign` header and rebuilds the canonical string
/// accordingly, so every version here must match the server's canonicalization byte for byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthVersion {
    /// SHA-1 content hashes; the client name is signed as-is.
    #[default]
    #[serde(rename = "1.0")]
    V1_0,
    /// SHA-1 content hashes; the client name is signed as its base64 SHA-1 digest.
    #[serde(rename = "1.1")]
    V1_1,
    /// SHA-256 content hashes and a digest-based signature. Required for keys that are too
    /// small to sign the canonical string directly, and for server API version negotiation.
    #[serde(rename = "1.3")]
    V1_3,
}

impl AuthVersion {
    /// The value of the `version=` field in `X-Ops-Sign`.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthVersion::V1_0 => "1.0",
            AuthVersion::V1_1 => "1.1",
            AuthVersion::V1_3 => "1.3",
        }
    }

    /// The digest used for the path and body hashes.
    pub fn digest(self) -> DigestAlgorithm {
        match self {
            AuthVersion::V1_0 | AuthVersion::V1_1 => DigestAlgorithm::Sha1,
            AuthVersion::V1_3 => DigestAlgorithm::Sha256,
        }
    }

    /// How the canonical string is turned into an RSA signature.
    pub fn signature_scheme(self) -> signature::SignatureScheme {
        match self {
            AuthVersion::V1_0 | AuthVersion::V1_1 => signature::SignatureScheme::Unhashed,
            AuthVersion::V1_3 => signature::SignatureScheme::Digest(DigestAlgorithm::Sha256),
        }
    }

    /// The full `X-Ops-Sign` header value.
    pub fn sign_header(self) -> String {
        format!("algorithm={};version={}", self.digest().name(), self.as_str())
    }
}

impl fmt::Display for AuthVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(AuthVersion::V1_0),
            "1.1" => Ok(AuthVersion::V1_1),
            "1.3" => Ok(AuthVersion::V1_3),
            other => Err(format!(
                "unsupported authentication version '{other}'; expected 1.0, 1.1, or 1.3"
            )),
        }
    }
}

/// A Chef API client: its name and RSA private key.
///
/// The server is assumed to already know the matching public key. The key is loaded once and
/// never written anywhere by this crate.
#[derive(Clone)]
pub struct Identity {
    client_name: String,
    key: PKey<Private>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("client_name", &self.client_name)
            .field("key_bits", &self.key.bits())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Create an identity from a PEM-encoded RSA private key (PKCS#1 or PKCS#8).
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Pem`] if the PEM is malformed and [`KeyError::NotRsa`] if it holds
    /// some other kind of key.
    pub fn from_pem(client_name: impl Into<String>, pem: &[u8]) -> Result<Self, KeyError> {
        let key = PKey::private_key_from_pem(pem)?;
        if key.id() != Id::RSA {
            return Err(KeyError::NotRsa(key.id()));
        }

        Ok(Self {
            client_name: client_name.into(),
            key,
        })
    }

    /// Create an identity by reading a PEM-encoded private key from `path`.
    pub fn from_file(client_name: impl Into<String>, path: &Path) -> Result<Self, KeyError> {
        let pem = std::fs::read(path)?;
        Self::from_pem(client_name, &pem)
    }

    /// Wrap an existing RSA key.
    pub fn from_rsa(client_name: impl Into<String>, rsa: Rsa<Private>) -> Result<Self, KeyError> {
        Ok(Self {
            client_name: client_name.into(),
            key: PKey::from_rsa(rsa)?,
        })
    }

    /// The name the server knows this client by.
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub(crate) fn private_key(&self) -> &PKey<Private> {
        &self.key
    }

    pub(crate) fn rsa(&self) -> Result<Rsa<Private>, openssl::error::ErrorStack> {
        self.key.rsa()
    }

    /// The PEM-encoded (SubjectPublicKeyInfo) public half of this identity's key.
    pub fn public_key_pem(&self) -> Result<String, KeyError> {
        let pem = self.key.public_key_to_pem()?;
        Ok(String::from_utf8_lossy(&pem).into_owned())
    }
}
