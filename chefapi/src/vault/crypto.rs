// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The cryptography behind vault items.
//!
//! Each vault item has a random 256-bit shared secret. The secret is encrypted separately for
//! every authorized client with RSA PKCS #1 v1.5 and stored in the keys item. Values in the
//! primary item are encrypted with AES-256-GCM under the SHA-256 digest of the secret, each with
//! its own random IV (the "version 3" encrypted data bag format).

use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{HasPublic, PKey, Private},
    rsa::{Padding, Rsa},
    symm::Cipher,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::VaultError;

/// The only encrypted value format version this crate reads or writes.
pub const SUPPORTED_VERSION: u64 = 3;

/// The cipher name recorded in each encrypted value.
pub const ALGORITHM: &str = "aes-256-gcm";

const SECRET_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const WRAPPER: &str = "json_wrapper";

/// A 256-bit AES key derived from a vault item's shared secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; 32]);

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

impl SharedKey {
    /// Derive the AES key from the raw secret recovered from the keys item.
    pub fn derive(secret: &[u8]) -> Result<Self, ErrorStack> {
        let digest = openssl::hash::hash(MessageDigest::sha256(), secret)?;
        let mut key = [0; 32];
        key.copy_from_slice(&digest);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Generate a new random shared secret.
pub fn generate_secret() -> Result<Vec<u8>, ErrorStack> {
    let mut secret = vec![0; SECRET_LEN];
    openssl::rand::rand_bytes(&mut secret)?;
    Ok(secret)
}

fn generate_iv() -> Result<[u8; IV_LEN], ErrorStack> {
    let mut iv = [0; IV_LEN];
    openssl::rand::rand_bytes(&mut iv)?;
    Ok(iv)
}

/// Encrypt `plaintext` with AES-256-GCM, returning the authentication tag and the ciphertext.
pub fn encrypt_value(
    key: &SharedKey,
    iv: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), ErrorStack> {
    let mut tag = vec![0; TAG_LEN];
    let ciphertext = openssl::symm::encrypt_aead(
        Cipher::aes_256_gcm(),
        key.as_bytes(),
        Some(iv),
        &[],
        plaintext,
        &mut tag,
    )?;
    Ok((tag, ciphertext))
}

/// Decrypt and authenticate an AES-256-GCM ciphertext.
///
/// Any change to the ciphertext, tag, or IV results in an error.
pub fn decrypt_value(
    key: &SharedKey,
    iv: &[u8],
    tag: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, ErrorStack> {
    openssl::symm::decrypt_aead(
        Cipher::aes_256_gcm(),
        key.as_bytes(),
        Some(iv),
        &[],
        ciphertext,
        tag,
    )
}

/// Encrypt the shared secret for the holder of `public_key`, returning it base64-encoded.
pub fn encode_shared_secret<T: HasPublic>(
    public_key: &PKey<T>,
    secret: &[u8],
) -> Result<String, ErrorStack> {
    let rsa = public_key.rsa()?;
    let mut encrypted = vec![0; rsa.size() as usize];
    let len = rsa.public_encrypt(secret, &mut encrypted, Padding::PKCS1)?;
    encrypted.truncate(len);
    Ok(openssl::base64::encode_block(&encrypted))
}

/// Recover the shared secret from its base64-encoded, RSA-encrypted form.
pub fn decode_shared_secret(private_key: &Rsa<Private>, encoded: &str) -> Result<Vec<u8>, VaultError> {
    let encrypted = decode_base64("shared secret", encoded)?;
    let mut secret = vec![0; private_key.size() as usize];
    let len = private_key.private_decrypt(&encrypted, &mut secret, Padding::PKCS1)?;
    secret.truncate(len);
    Ok(secret)
}

/// An encrypted value as stored in the primary vault item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    pub encrypted_data: String,
    pub iv: String,
    pub auth_tag: String,
    pub version: u64,
    pub cipher: String,
}

impl EncryptedValue {
    /// Encrypt a JSON value under `key` with a fresh IV.
    ///
    /// The value is wrapped as `{"json_wrapper": value}` before encryption so that scalars
    /// survive the trip through JSON.
    pub fn seal(key: &SharedKey, value: &Value) -> Result<Self, VaultError> {
        let plaintext = serde_json::to_vec(&json!({ WRAPPER: value }))?;
        let iv = generate_iv()?;
        let (tag, ciphertext) = encrypt_value(key, &iv, &plaintext)?;

        Ok(Self {
            encrypted_data: openssl::base64::encode_block(&ciphertext),
            iv: openssl::base64::encode_block(&iv),
            auth_tag: openssl::base64::encode_block(&tag),
            version: SUPPORTED_VERSION,
            cipher: ALGORITHM.to_string(),
        })
    }

    /// Parse a stored value, rejecting any format version other than 3 before looking at the
    /// rest of it.
    pub fn from_json(field: &str, value: &Value) -> Result<Self, VaultError> {
        let version = value.get("version");
        let supported = version
            .map(|version| {
                version.as_u64() == Some(SUPPORTED_VERSION)
                    || version.as_f64() == Some(SUPPORTED_VERSION as f64)
            })
            .unwrap_or(false);
        if !supported {
            return Err(VaultError::UnsupportedVersion {
                found: version
                    .map(Value::to_string)
                    .unwrap_or_else(|| "none".to_string()),
            });
        }

        let object = value.as_object().ok_or_else(|| {
            VaultError::MalformedEnvelope(format!("'{field}' is not an object"))
        })?;
        let string_field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    VaultError::MalformedEnvelope(format!("'{field}' is missing '{name}'"))
                })
        };
        let cipher = match object.get("cipher") {
            None => ALGORITHM.to_string(),
            Some(_) => string_field("cipher")?,
        };
        if cipher != ALGORITHM {
            return Err(VaultError::MalformedEnvelope(format!(
                "'{field}' uses unsupported cipher '{cipher}'"
            )));
        }

        Ok(Self {
            encrypted_data: string_field("encrypted_data")?,
            iv: string_field("iv")?,
            auth_tag: string_field("auth_tag")?,
            version: SUPPORTED_VERSION,
            cipher,
        })
    }

    /// Decrypt and unwrap the value.
    pub fn open(&self, field: &str, key: &SharedKey) -> Result<Value, VaultError> {
        if self.version != SUPPORTED_VERSION {
            return Err(VaultError::UnsupportedVersion {
                found: self.version.to_string(),
            });
        }
        let ciphertext = decode_base64(field, &self.encrypted_data)?;
        let iv = decode_base64(field, &self.iv)?;
        let tag = decode_base64(field, &self.auth_tag)?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(VaultError::MalformedEnvelope(format!(
                "'{field}' has a {}-byte IV and {}-byte tag; expected {IV_LEN} and {TAG_LEN}",
                iv.len(),
                tag.len()
            )));
        }

        let plaintext = decrypt_value(key, &iv, &tag, &ciphertext).map_err(|error| {
            tracing::debug!(field, ?error, "Authenticated decryption failed");
            VaultError::Integrity {
                field: field.to_string(),
            }
        })?;
        let mut wrapped: Value = serde_json::from_slice(&plaintext)?;
        wrapped
            .get_mut(WRAPPER)
            .map(Value::take)
            .ok_or_else(|| VaultError::MalformedEnvelope(format!("'{field}' has no {WRAPPER}")))
    }
}

// Ruby's Base64.encode64 inserts newlines every 60 characters, so strip whitespace first.
fn decode_base64(field: &str, encoded: &str) -> Result<Vec<u8>, VaultError> {
    let compact = encoded.split_whitespace().collect::<String>();
    openssl::base64::decode_block(&compact)
        .map_err(|_| VaultError::MalformedEnvelope(format!("'{field}' is not valid base64")))
}
