// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Signing outgoing requests.
//!
//! The server recomputes the canonical string from the request it receives, so every value that
//! goes into it (the path, the body hash, the timestamp, the user ID) must be derived exactly as
//! the server derives it, and in the same order.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};

use super::{signature, AuthVersion, Identity};
use crate::{
    digest::{self, DigestAlgorithm},
    error::SigningError,
};

/// The Chef client version this library presents itself as.
pub const DEFAULT_CHEF_VERSION: &str = "11.12.0";

/// The server API version requested when none is configured.
pub const DEFAULT_SERVER_API_VERSION: &str = "1";

const X_CHEF_VERSION: HeaderName = HeaderName::from_static("x-chef-version");
const X_OPS_TIMESTAMP: HeaderName = HeaderName::from_static("x-ops-timestamp");
const X_OPS_USERID: HeaderName = HeaderName::from_static("x-ops-userid");
const X_OPS_SIGN: HeaderName = HeaderName::from_static("x-ops-sign");
const X_OPS_CONTENT_HASH: HeaderName = HeaderName::from_static("x-ops-content-hash");
const X_OPS_SERVER_API_VERSION: HeaderName = HeaderName::from_static("x-ops-server-api-version");

/// Collapse runs of `/` into one and drop a trailing `/`.
///
/// Nothing else is changed: case and percent-encoding must match what the server sees.
pub fn canonical_path(path: &str) -> String {
    let mut canonical = String::with_capacity(path.len());
    let mut previous_slash = false;
    for character in path.chars() {
        if character == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        canonical.push(character);
    }
    if canonical.len() > 1 && canonical.ends_with('/') {
        canonical.pop();
    }

    canonical
}

/// The values a request signature covers.
///
/// These are derived fresh for each request and thrown away once it's signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    pub version: AuthVersion,
    pub method: String,
    pub path: String,
    pub content_hash: String,
    pub timestamp: String,
    pub user_id: String,
    pub server_api_version: String,
}

impl CanonicalRequest {
    /// Derive the canonical values for a request.
    ///
    /// An empty body is hashed like any other: its content hash is the digest of zero bytes.
    pub fn new(
        version: AuthVersion,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: &str,
        user_id: &str,
        server_api_version: &str,
    ) -> Self {
        Self {
            version,
            method: method.to_ascii_uppercase(),
            path: canonical_path(path),
            content_hash: digest::hash_base64(version.digest(), body),
            timestamp: timestamp.to_string(),
            user_id: user_id.to_string(),
            server_api_version: server_api_version.to_string(),
        }
    }

    /// The fields of the canonical string, in signing order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self.version {
            AuthVersion::V1_0 | AuthVersion::V1_1 => {
                let user_id = if self.version == AuthVersion::V1_1 {
                    digest::hash_base64(DigestAlgorithm::Sha1, self.user_id.as_bytes())
                } else {
                    self.user_id.clone()
                };
                vec![
                    ("Method", self.method.clone()),
                    (
                        "Hashed Path",
                        digest::hash_base64(self.version.digest(), self.path.as_bytes()),
                    ),
                    ("X-Ops-Content-Hash", self.content_hash.clone()),
                    ("X-Ops-Timestamp", self.timestamp.clone()),
                    ("X-Ops-UserId", user_id),
                ]
            }
            AuthVersion::V1_3 => vec![
                ("Method", self.method.clone()),
                ("Path", self.path.clone()),
                ("X-Ops-Content-Hash", self.content_hash.clone()),
                ("X-Ops-Sign", format!("version={}", self.version)),
                ("X-Ops-Timestamp", self.timestamp.clone()),
                ("X-Ops-UserId", self.user_id.clone()),
                ("X-Ops-Server-API-Version", self.server_api_version.clone()),
            ],
        }
    }

    /// The exact string that gets signed: `Name:value` lines joined by newlines, with no
    /// trailing newline.
    pub fn canonical_string(&self) -> String {
        self.fields()
            .into_iter()
            .map(|(name, value)| format!("{name}:{value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Signs requests on behalf of an [`Identity`].
#[derive(Debug, Clone)]
pub struct RequestSigner {
    identity: Identity,
    version: AuthVersion,
    chef_version: String,
    server_api_version: String,
    chunk_size: usize,
}

impl RequestSigner {
    pub fn new(identity: Identity, version: AuthVersion) -> Self {
        Self {
            identity,
            version,
            chef_version: DEFAULT_CHEF_VERSION.to_string(),
            server_api_version: DEFAULT_SERVER_API_VERSION.to_string(),
            chunk_size: signature::DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the `X-Chef-Version` header value.
    pub fn with_chef_version(mut self, chef_version: impl Into<String>) -> Self {
        self.chef_version = chef_version.into();
        self
    }

    /// Set the `X-Ops-Server-API-Version` header value.
    pub fn with_server_api_version(mut self, server_api_version: impl Into<String>) -> Self {
        self.server_api_version = server_api_version.into();
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn version(&self) -> AuthVersion {
        self.version
    }

    /// Produce the complete set of authentication headers for a request.
    ///
    /// `path` is canonicalized before hashing; callers sending the request should use
    /// [`canonical_path`] for the request URL as well.
    pub fn headers(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: &str,
    ) -> Result<HeaderMap, SigningError> {
        let canonical = CanonicalRequest::new(
            self.version,
            method,
            path,
            body,
            timestamp,
            self.identity.client_name(),
            &self.server_api_version,
        );
        tracing::debug!(path = canonical.path, "Signing canonical request");

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        insert(&mut headers, X_CHEF_VERSION, &self.chef_version)?;
        insert(&mut headers, X_OPS_TIMESTAMP, &canonical.timestamp)?;
        insert(&mut headers, X_OPS_USERID, &canonical.user_id)?;
        insert(&mut headers, X_OPS_SIGN, &self.version.sign_header())?;
        insert(&mut headers, X_OPS_CONTENT_HASH, &canonical.content_hash)?;
        insert(
            &mut headers,
            X_OPS_SERVER_API_VERSION,
            &canonical.server_api_version,
        )?;

        let raw_signature = signature::sign(
            self.identity.private_key(),
            canonical.canonical_string().as_bytes(),
            self.version.signature_scheme(),
        )?;
        let chunks = signature::chunk_encode(&raw_signature, self.chunk_size);
        for (name, value) in signature::authorization_headers(&chunks) {
            let name = HeaderName::try_from(name)?;
            insert(&mut headers, name, value)?;
        }

        Ok(headers)
    }

    /// Sign `request` in place using the current time.
    pub fn sign_request(&self, request: &mut reqwest::Request) -> Result<(), SigningError> {
        let timestamp = chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        self.sign_request_at(request, &timestamp)
    }

    /// Sign `request` in place with a fixed timestamp.
    ///
    /// The request's URL path is replaced with its canonical form. If anything fails, the
    /// request is left without authentication headers rather than with a partial set.
    #[tracing::instrument(
        skip_all,
        fields(method = %request.method(), client = self.identity.client_name())
    )]
    pub fn sign_request_at(
        &self,
        request: &mut reqwest::Request,
        timestamp: &str,
    ) -> Result<(), SigningError> {
        let body = match request.body() {
            Some(body) => body.as_bytes().ok_or(SigningError::StreamingBody)?,
            None => &[],
        };
        let path = canonical_path(request.url().path());
        let headers = self.headers(request.method().as_str(), &path, body, timestamp)?;

        request.url_mut().set_path(&path);
        let request_headers = request.headers_mut();
        let stale = request_headers
            .keys()
            .filter(|name| name.as_str().starts_with("x-ops-authorization-"))
            .cloned()
            .collect::<Vec<_>>();
        for name in stale {
            request_headers.remove(name);
        }
        for (name, value) in headers.iter() {
            request_headers.insert(name.clone(), value.clone());
        }
        tracing::debug!(headers = headers.len(), "Request signed");

        Ok(())
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) -> Result<(), SigningError> {
    let value = HeaderValue::from_str(value).map_err(|source| SigningError::InvalidHeader {
        name: name.to_string(),
        source,
    })?;
    headers.insert(name, value);
    Ok(())
}
