// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Message digest helpers.
//!
//! Digests are returned base64-encoded for use in authentication headers, or hex-encoded for
//! file checksums as used by cookbook sandboxes.

use std::{fs::File, io::Read, path::Path};

use openssl::hash::{Hasher, MessageDigest};

/// The digest algorithms the Chef server knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub(crate) fn message_digest(self) -> MessageDigest {
        match self {
            DigestAlgorithm::Md5 => MessageDigest::md5(),
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha224 => MessageDigest::sha224(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    /// The name used in the `algorithm=` field of the `X-Ops-Sign` header.
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha224 => "sha224",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }
}

/// Compute the raw digest of `data`.
pub fn hash(algorithm: DigestAlgorithm, data: &[u8]) -> Vec<u8> {
    // Every variant maps to a digest OpenSSL always provides, so this only fails if OpenSSL
    // itself is broken.
    openssl::hash::hash(algorithm.message_digest(), data)
        .map(|digest| digest.to_vec())
        .expect("OpenSSL supports all DigestAlgorithm variants")
}

/// Compute the digest of `data` and base64-encode it.
pub fn hash_base64(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    openssl::base64::encode_block(&hash(algorithm, data))
}

/// Compute the digest of `data` and hex-encode it in lowercase.
pub fn hash_hex(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    hex::encode(hash(algorithm, data))
}

/// Base64-encoded SHA-1 of a string.
pub fn hash_str(data: &str) -> String {
    hash_base64(DigestAlgorithm::Sha1, data.as_bytes())
}

/// Base64-encoded SHA-256 of a string.
pub fn hash_str256(data: &str) -> String {
    hash_base64(DigestAlgorithm::Sha256, data.as_bytes())
}

/// Stream the file at `path` through MD5 and return the lowercase hex digest.
pub fn file_md5_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new(MessageDigest::md5()).map_err(std::io::Error::other)?;
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]).map_err(std::io::Error::other)?;
    }
    let digest = hasher.finish().map_err(std::io::Error::other)?;

    Ok(hex::encode(digest))
}

/// Returns true if the file at `path` exists and its MD5 digest matches the hex `checksum`.
pub fn verify_md5_checksum(path: &Path, checksum: &str) -> bool {
    match file_md5_checksum(path) {
        Ok(digest) => digest.eq_ignore_ascii_case(checksum),
        Err(error) => {
            tracing::debug!(path = %path.display(), ?error, "Unable to checksum file");
            false
        }
    }
}

/// Convert a hex MD5 checksum to base64, the form the sandbox upload API expects in
/// `Content-MD5`.
pub fn md5_base64_checksum(checksum: &str) -> Result<String, hex::FromHexError> {
    let bytes = hex::decode(checksum)?;
    Ok(openssl::base64::encode_block(&bytes))
}
