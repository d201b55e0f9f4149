// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The Chef server client.
//!
//! Every request is signed with the configured [`Identity`] immediately before it's sent; a
//! request that can't be signed is never sent.
use std::{path::PathBuf, sync::Arc, time::Duration};

use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Method, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use crate::{
    auth::{
        request::{DEFAULT_CHEF_VERSION, DEFAULT_SERVER_API_VERSION},
        AuthVersion, Identity, RequestSigner,
    },
    config::Credentials,
    error::ClientError,
};

mod data_bags;

pub use data_bags::{DataBagItem, DataBagStore};

/// Configuration for the Chef server client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The organization's base URL, for example `https://chef.example.com/organizations/test/`.
    ///
    /// Request paths are resolved relative to this URL.
    pub server_url: Url,
    /// The version of the signing protocol; one of "1.0", "1.1", or "1.3". The default is 1.0.
    #[serde(default)]
    pub authentication_version: AuthVersion,
    /// The value sent in `X-Chef-Version`.
    #[serde(default = "default_chef_version")]
    pub chef_version: String,
    /// The value sent in `X-Ops-Server-API-Version`.
    #[serde(default = "default_server_api_version")]
    pub server_api_version: String,
    /// The number of seconds to wait for a response before giving up on a request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Skip TLS certificate verification. Only use this against test servers.
    #[serde(default)]
    pub skip_ssl_verification: bool,
    /// The client name and key used to sign requests.
    pub credentials: Credentials,
}

fn default_chef_version() -> String {
    DEFAULT_CHEF_VERSION.to_string()
}

fn default_server_api_version() -> String {
    DEFAULT_SERVER_API_VERSION.to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: Url::parse("https://chef.example.com/organizations/example/")
                .expect("the default URL is valid"),
            authentication_version: AuthVersion::default(),
            chef_version: default_chef_version(),
            server_api_version: default_server_api_version(),
            request_timeout_secs: default_request_timeout_secs(),
            skip_ssl_verification: false,
            credentials: Credentials {
                client_name: "example-client".to_string(),
                client_key: PathBuf::from("chefapi.client_key.pem"),
            },
        }
    }
}

#[cfg(feature = "cli")]
impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

/// A Chef server client.
///
/// Cloning is cheap and clones share the underlying connection pool.
#[derive(Clone, Debug)]
pub struct Client {
    base_url: Arc<Url>,
    signer: Arc<RequestSigner>,
    http: reqwest::Client,
}

impl Client {
    /// Create a new client, loading the private key named in the configuration.
    pub fn new(config: Config) -> Result<Self, ClientError> {
        let identity = config.credentials.identity()?;
        let signer = RequestSigner::new(identity, config.authentication_version)
            .with_chef_version(config.chef_version)
            .with_server_api_version(config.server_api_version);

        Self::with_signer(
            config.server_url,
            signer,
            Duration::from_secs(config.request_timeout_secs),
            config.skip_ssl_verification,
        )
    }

    /// Create a client for an identity that is already loaded.
    pub fn from_identity(
        server_url: Url,
        identity: Identity,
        version: AuthVersion,
    ) -> Result<Self, ClientError> {
        Self::with_signer(
            server_url,
            RequestSigner::new(identity, version),
            Duration::from_secs(default_request_timeout_secs()),
            false,
        )
    }

    fn with_signer(
        mut server_url: Url,
        signer: RequestSigner,
        timeout: Duration,
        skip_ssl_verification: bool,
    ) -> Result<Self, ClientError> {
        // Without the trailing slash, Url::join replaces the last path segment.
        if !server_url.path().ends_with('/') {
            let path = format!("{}/", server_url.path());
            server_url.set_path(&path);
        }

        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_ssl_verification)
            .build()?;

        Ok(Self {
            base_url: Arc::new(server_url),
            signer: Arc::new(signer),
            http,
        })
    }

    /// The identity requests are signed with.
    pub fn identity(&self) -> &Identity {
        self.signer.identity()
    }

    /// The organization base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` against the base URL.
    pub fn url(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Append `segments` to the base URL's path, percent-encoding each one.
    ///
    /// Use this for paths built from names, so a name containing `/`, `?`, or `#` can't address
    /// a different resource.
    pub fn segments_url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut resolved = Url::clone(&self.base_url);
        resolved
            .path_segments_mut()
            .map_err(|()| ClientError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(resolved)
    }

    /// Sign and send a request, mapping unsuccessful statuses to errors.
    #[instrument(skip(self, url, body), fields(client = self.identity().client_name(), url = %url))]
    pub async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, ClientError> {
        let path = url.path().to_string();
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.body(body);
        }
        let mut request = request.build()?;
        self.signer.sign_request(&mut request)?;

        let response = self.http.execute(request).await?;
        let status = response.status();
        tracing::debug!(%status, "Received response");
        match status {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(path)),
            StatusCode::CONFLICT => Err(ClientError::Conflict(path)),
            status => Err(ClientError::Http {
                status,
                body: response.text().await?,
            }),
        }
    }

    /// GET `url` and decode the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        let response = self.send(Method::GET, url, None).await?;
        decode(response).await
    }

    /// POST `body` as JSON to `url` and decode the JSON response.
    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, ClientError> {
        let body = serde_json::to_vec(body)?;
        let response = self.send(Method::POST, url, Some(body)).await?;
        decode(response).await
    }

    /// PUT `body` as JSON to `url` and decode the JSON response.
    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, ClientError> {
        let body = serde_json::to_vec(body)?;
        let response = self.send(Method::PUT, url, Some(body)).await?;
        decode(response).await
    }

    /// DELETE `url`, discarding the response body.
    pub async fn delete(&self, url: Url) -> Result<(), ClientError> {
        self.send(Method::DELETE, url, None).await?;
        Ok(())
    }
}

// The server sometimes answers with an empty body; treat that as JSON null.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let text = response.text().await?;
    if text.trim().is_empty() {
        Ok(serde_json::from_str("null")?)
    } else {
        Ok(serde_json::from_str(&text)?)
    }
}
