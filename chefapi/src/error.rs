// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for request signing, the Chef server client, and vaults.

use reqwest::StatusCode;

/// Errors loading a client's RSA private key.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The key file could not be read.
    #[error("failed to read private key file: {0}")]
    Io(#[from] std::io::Error),

    /// The key is not valid PEM, or OpenSSL could not parse it.
    #[error("private key could not be parsed: {0}")]
    Pem(#[from] openssl::error::ErrorStack),

    /// The key parsed, but it is not an RSA key.
    ///
    /// The Chef server only accepts RSA client keys.
    #[error("private key is a {0:?} key; only RSA keys are supported")]
    NotRsa(openssl::pkey::Id),
}

/// Errors that occur while signing a request.
///
/// None of these are transient; retrying the same request with the same key will fail again.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SigningError {
    /// The canonical content does not fit in a single RSA block for this key.
    ///
    /// Protocol versions 1.0 and 1.1 sign the canonical string directly, so the key must be at
    /// least `content_len + 11` bytes wide. Use a larger key or protocol version 1.3.
    #[error(
        "signature generation failed: {content_len} bytes of canonical content do not fit a \
         {key_bits}-bit RSA key"
    )]
    KeyTooSmall { key_bits: u32, content_len: usize },

    /// OpenSSL failed to produce or check a signature.
    #[error("signature generation failed: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),

    /// The request body is a stream and can't be hashed without consuming it.
    #[error("request bodies must be buffered in memory to be signed")]
    StreamingBody,

    /// A value derived during signing is not a legal HTTP header value.
    ///
    /// This usually means the client name contains control characters.
    #[error("invalid value for header {name}: {source}")]
    InvalidHeader {
        name: String,
        #[source]
        source: reqwest::header::InvalidHeaderValue,
    },

    #[error("invalid header name: {0}")]
    InvalidHeaderName(#[from] reqwest::header::InvalidHeaderName),

    /// The `X-Ops-Authorization-N` headers are missing, out of range, or have a gap.
    #[error("malformed authorization headers: {0}")]
    MalformedAuthorization(String),
}

/// Errors the [`crate::client::Client`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The request could not be signed, and so was never sent.
    #[error("failed to sign request: {0}")]
    Signing(#[from] SigningError),

    /// The client key could not be loaded.
    #[error("failed to load client key: {0}")]
    Key(#[from] KeyError),

    /// The request URL could not be constructed.
    #[error("invalid request URL: {0}")]
    Url(#[from] url::ParseError),

    /// Returned in the event that an error occurred while communicating with the Chef server.
    ///
    /// This may be a transient networking problem, in which case retrying is reasonable, or a
    /// permanent one such as an incorrect hostname or TLS failure.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server responded with 404 Not Found.
    #[error("{0} was not found on the server")]
    NotFound(String),

    /// The server responded with 409 Conflict; the object already exists.
    #[error("{0} already exists on the server")]
    Conflict(String),

    /// The server responded with some other unsuccessful status.
    #[error("the server responded with HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("Failed to serialize a request or response to JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns true if the error is a 404 from the server.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// Errors working with an encrypted vault item.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum VaultError {
    /// The item's keys do not include an entry for this client.
    ///
    /// The vault exists, but an administrator must grant this client access before it can be
    /// read or updated.
    #[error("{item} is not encrypted with your key")]
    NotEncryptedWithYourKey { item: String },

    /// The encrypted value uses a format version other than 3.
    #[error("only version 3 of the encrypted data bag item format is supported (found {found})")]
    UnsupportedVersion { found: String },

    /// Authenticated decryption failed: the ciphertext, tag, or IV was altered, or the key is
    /// wrong. This is never transient.
    #[error("vault value '{field}' failed authentication; it is corrupted or was tampered with")]
    Integrity { field: String },

    /// An encrypted value or keys entry is structurally invalid.
    #[error("malformed vault data: {0}")]
    MalformedEnvelope(String),

    /// A cryptographic operation other than authenticated decryption failed.
    #[error("vault cryptography failed: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// A request to the data bag store failed.
    ///
    /// If this happens part-way through [`crate::vault::VaultService::create_item`], the vault
    /// may have been partially created; the caller is responsible for cleaning up.
    #[error(transparent)]
    Store(#[from] ClientError),

    #[error("Failed to serialize a vault value to JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The requested change would leave the vault item with no authorized administrators.
    #[error("{item} must keep at least one administrator")]
    LastAdmin { item: String },
}
