// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! RSA signatures and the `X-Ops-Authorization-N` header encoding.
//!
//! Signatures are PKCS #1 v1.5. The older protocol versions sign the canonical string itself
//! (a raw "private encrypt" with no DigestInfo), while 1.3 signs a SHA-256 DigestInfo in the
//! usual way. The base64 signature is split into fixed-width chunks, one per header, and the
//! server concatenates them in index order.

use std::collections::BTreeMap;

use openssl::{
    pkey::{HasPublic, PKey, PKeyRef, Private},
    rsa::Padding,
    sign::{Signer, Verifier},
};
use reqwest::header::HeaderMap;

use crate::{digest::DigestAlgorithm, error::SigningError};

/// The width of each `X-Ops-Authorization-N` header value.
pub const DEFAULT_CHUNK_SIZE: usize = 60;

const AUTHORIZATION_PREFIX: &str = "x-ops-authorization-";

// PKCS #1 v1.5 block formatting needs at least 11 bytes of padding.
const PKCS1_OVERHEAD: usize = 11;

/// How a canonical string is turned into a PKCS #1 v1.5 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Pad and sign the canonical bytes directly, with no digest or DigestInfo.
    Unhashed,
    /// Hash the canonical bytes and sign the DER DigestInfo for that digest.
    Digest(DigestAlgorithm),
}

impl SignatureScheme {
    // The number of bytes that go into the RSA block, before padding.
    fn block_len(self, content_len: usize) -> usize {
        match self {
            SignatureScheme::Unhashed => content_len,
            SignatureScheme::Digest(algorithm) => {
                // DER prefix lengths for the DigestInfo of each algorithm, RFC 8017 section 9.2.
                let prefix = match algorithm {
                    DigestAlgorithm::Md5 => 18,
                    DigestAlgorithm::Sha1 => 15,
                    _ => 19,
                };
                prefix + algorithm.message_digest().size()
            }
        }
    }
}

/// Sign `content` with `key`.
///
/// # Errors
///
/// Returns [`SigningError::KeyTooSmall`] if the content (or DigestInfo) does not fit in the
/// key's modulus, and [`SigningError::Openssl`] if the key is unusable.
pub fn sign(
    key: &PKeyRef<Private>,
    content: &[u8],
    scheme: SignatureScheme,
) -> Result<Vec<u8>, SigningError> {
    let key_bytes = key.size();
    let block_len = scheme.block_len(content.len());
    if block_len + PKCS1_OVERHEAD > key_bytes {
        return Err(SigningError::KeyTooSmall {
            key_bits: key.bits(),
            content_len: block_len,
        });
    }

    let signature = match scheme {
        SignatureScheme::Unhashed => {
            let rsa = key.rsa()?;
            let mut signature = vec![0; key_bytes];
            let len = rsa.private_encrypt(content, &mut signature, Padding::PKCS1)?;
            signature.truncate(len);
            signature
        }
        SignatureScheme::Digest(algorithm) => {
            let mut signer = Signer::new(algorithm.message_digest(), key)?;
            signer.set_rsa_padding(Padding::PKCS1)?;
            signer.sign_oneshot_to_vec(content)?
        }
    };

    Ok(signature)
}

/// Check that `signature` is a valid signature of `content` for `key`.
///
/// Returns `Ok(false)` if the signature does not match; errors are reserved for keys OpenSSL
/// can't use.
pub fn verify<T: HasPublic>(
    key: &PKey<T>,
    content: &[u8],
    signature: &[u8],
    scheme: SignatureScheme,
) -> Result<bool, SigningError> {
    match scheme {
        SignatureScheme::Unhashed => {
            let rsa = key.rsa()?;
            let mut recovered = vec![0; rsa.size() as usize];
            match rsa.public_decrypt(signature, &mut recovered, Padding::PKCS1) {
                Ok(len) => Ok(&recovered[..len] == content),
                Err(error) => {
                    tracing::debug!(?error, "Signature failed to decrypt with the public key");
                    Ok(false)
                }
            }
        }
        SignatureScheme::Digest(algorithm) => {
            let mut verifier = Verifier::new(algorithm.message_digest(), key)?;
            verifier.set_rsa_padding(Padding::PKCS1)?;
            Ok(verifier.verify_oneshot(signature, content).unwrap_or(false))
        }
    }
}

/// Base64-encode `signature` and split it into `chunk_size` pieces.
///
/// A `chunk_size` of zero produces a single chunk holding the whole encoding. The final chunk
/// may be shorter than `chunk_size`.
pub fn chunk_encode(signature: &[u8], chunk_size: usize) -> Vec<String> {
    let encoded = openssl::base64::encode_block(signature);
    if chunk_size == 0 {
        return vec![encoded];
    }

    // Base64 is ASCII, so byte chunks are always on character boundaries.
    encoded
        .as_bytes()
        .chunks(chunk_size)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

/// The header names and values for a chunked signature, starting at `X-Ops-Authorization-1`.
pub fn authorization_headers(chunks: &[String]) -> impl Iterator<Item = (String, &str)> {
    chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| (format!("X-Ops-Authorization-{}", index + 1), chunk.as_str()))
}

/// Reassemble and decode a signature from its `X-Ops-Authorization-N` headers.
///
/// This is the server's half of [`chunk_encode`]. The indices must run from 1 with no gaps or
/// duplicates; a missing chunk is an error rather than a shorter signature.
pub fn reassemble(headers: &HeaderMap) -> Result<Vec<u8>, SigningError> {
    let mut chunks = BTreeMap::new();
    for (name, value) in headers {
        let Some(index) = name.as_str().strip_prefix(AUTHORIZATION_PREFIX) else {
            continue;
        };
        let index = index.parse::<usize>().map_err(|_| {
            SigningError::MalformedAuthorization(format!("'{name}' has a non-numeric index"))
        })?;
        let value = value.to_str().map_err(|_| {
            SigningError::MalformedAuthorization(format!("'{name}' is not valid ASCII"))
        })?;
        if chunks.insert(index, value).is_some() {
            return Err(SigningError::MalformedAuthorization(format!(
                "'{name}' was provided more than once"
            )));
        }
    }

    if chunks.is_empty() {
        return Err(SigningError::MalformedAuthorization(
            "no X-Ops-Authorization headers found".to_string(),
        ));
    }
    if let Some((expected, index)) = chunks
        .keys()
        .enumerate()
        .map(|(position, index)| (position + 1, *index))
        .find(|(expected, index)| expected != index)
    {
        return Err(SigningError::MalformedAuthorization(format!(
            "expected X-Ops-Authorization-{expected}, found X-Ops-Authorization-{index}"
        )));
    }

    let encoded = chunks.into_values().collect::<String>();
    openssl::base64::decode_block(&encoded).map_err(|error| {
        SigningError::MalformedAuthorization(format!("signature is not valid base64: {error}"))
    })
}

#[cfg(test)]
mod tests {
    use openssl::rsa::Rsa;
    use proptest::prelude::*;
    use reqwest::header::HeaderValue;

    use super::*;

    fn key(bits: u32) -> anyhow::Result<PKey<Private>> {
        Ok(PKey::from_rsa(Rsa::generate(bits)?)?)
    }

    #[test]
    fn sign_then_verify() -> anyhow::Result<()> {
        let key = key(2048)?;
        let public = PKey::public_key_from_pem(&key.public_key_to_pem()?)?;
        let content = b"Method:GET\nHashed Path:abc\nX-Ops-UserId:tester";

        for scheme in [
            SignatureScheme::Unhashed,
            SignatureScheme::Digest(DigestAlgorithm::Sha1),
            SignatureScheme::Digest(DigestAlgorithm::Sha256),
            SignatureScheme::Digest(DigestAlgorithm::Sha512),
        ] {
            let first = sign(&key, content, scheme)?;
            let second = sign(&key, content, scheme)?;
            assert_eq!(256, first.len());
            assert!(verify(&public, content, &first, scheme)?, "{scheme:?}");
            assert!(verify(&public, content, &second, scheme)?, "{scheme:?}");
            assert!(!verify(&public, b"something else", &first, scheme)?);
        }

        Ok(())
    }

    // A 1024-bit key leaves 117 bytes for unhashed content, which a real canonical string
    // exceeds.
    #[test]
    fn key_too_small_for_unhashed() -> anyhow::Result<()> {
        let key = key(1024)?;
        let content = [b'a'; 118];
        let result = sign(&key, &content, SignatureScheme::Unhashed);
        assert!(matches!(
            result,
            Err(SigningError::KeyTooSmall {
                key_bits: 1024,
                content_len: 118
            })
        ));

        // Digests always fit, though.
        sign(&key, &content, SignatureScheme::Digest(DigestAlgorithm::Sha256))?;
        Ok(())
    }

    #[test]
    fn key_too_small_for_digest() -> anyhow::Result<()> {
        let key = key(512)?;
        let result = sign(
            &key,
            b"content",
            SignatureScheme::Digest(DigestAlgorithm::Sha512),
        );
        assert!(matches!(result, Err(SigningError::KeyTooSmall { .. })));
        Ok(())
    }

    #[test]
    fn tampered_signature_does_not_verify() -> anyhow::Result<()> {
        let key = key(2048)?;
        let content = b"canonical";
        for scheme in [
            SignatureScheme::Unhashed,
            SignatureScheme::Digest(DigestAlgorithm::Sha256),
        ] {
            let mut signature = sign(&key, content, scheme)?;
            signature[10] ^= 0x01;
            assert!(!verify(&key, content, &signature, scheme)?);
        }
        Ok(())
    }

    #[test]
    fn chunk_widths() {
        let signature = [7_u8; 256];
        let chunks = chunk_encode(&signature, DEFAULT_CHUNK_SIZE);
        // 256 bytes is 344 base64 characters: five full chunks and one of 44.
        assert_eq!(6, chunks.len());
        assert!(chunks[..5].iter().all(|chunk| chunk.len() == 60));
        assert_eq!(44, chunks[5].len());

        let single = chunk_encode(&signature, 0);
        assert_eq!(1, single.len());
        assert_eq!(openssl::base64::encode_block(&signature), single[0]);
    }

    #[test]
    fn header_names_start_at_one() {
        let chunks = vec!["a".to_string(), "b".to_string()];
        let headers = authorization_headers(&chunks).collect::<Vec<_>>();
        assert_eq!(
            vec![
                ("X-Ops-Authorization-1".to_string(), "a"),
                ("X-Ops-Authorization-2".to_string(), "b")
            ],
            headers
        );
    }

    fn header_map(chunks: &[(usize, &str)]) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (index, chunk) in chunks {
            headers.insert(
                reqwest::header::HeaderName::from_bytes(
                    format!("X-Ops-Authorization-{index}").as_bytes(),
                )?,
                HeaderValue::from_str(chunk)?,
            );
        }
        Ok(headers)
    }

    #[test]
    fn reassemble_in_index_order() -> anyhow::Result<()> {
        let signature = (0..=255).collect::<Vec<u8>>();
        let chunks = chunk_encode(&signature, 60);
        // Insert in reverse so ordering comes from the index and not the header map.
        let indexed = chunks
            .iter()
            .enumerate()
            .rev()
            .map(|(index, chunk)| (index + 1, chunk.as_str()))
            .collect::<Vec<_>>();
        let headers = header_map(&indexed)?;

        assert_eq!(signature, reassemble(&headers)?);
        Ok(())
    }

    #[test]
    fn reassemble_rejects_gaps() -> anyhow::Result<()> {
        let signature = [1_u8; 256];
        let chunks = chunk_encode(&signature, 60);
        let indexed = chunks
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != 2)
            .map(|(index, chunk)| (index + 1, chunk.as_str()))
            .collect::<Vec<_>>();
        let headers = header_map(&indexed)?;

        let result = reassemble(&headers);
        assert!(matches!(
            result,
            Err(SigningError::MalformedAuthorization(ref message)) if message.contains("-3")
        ));
        Ok(())
    }

    #[test]
    fn reassemble_requires_first_chunk() -> anyhow::Result<()> {
        let headers = header_map(&[(2, "AAAA")])?;
        assert!(reassemble(&headers).is_err());
        assert!(reassemble(&HeaderMap::new()).is_err());
        Ok(())
    }

    proptest! {
        #[test]
        fn chunk_round_trip(signature in proptest::collection::vec(any::<u8>(), 1..600), chunk_size in 1_usize..120) {
            let chunks = chunk_encode(&signature, chunk_size);
            prop_assert!(chunks.iter().all(|chunk| chunk.len() <= chunk_size && !chunk.is_empty()));
            let joined = chunks.concat();
            prop_assert_eq!(openssl::base64::decode_block(&joined).unwrap(), signature);
        }
    }
}
