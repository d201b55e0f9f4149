// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Check signed requests the way a Chef server would: rebuild the canonical string from what
//! arrives on the wire and verify the reassembled signature with the client's public key.

use chefapi::{
    auth::{
        request::canonical_path,
        signature::{self, reassemble},
        CanonicalRequest, RequestSigner,
    },
    digest::{hash_base64, hash_str},
    error::SigningError,
    AuthVersion, Identity,
};
use openssl::{pkey::PKey, rsa::Rsa};
use reqwest::{header::HeaderMap, Method};

const VERSIONS: [AuthVersion; 3] = [AuthVersion::V1_0, AuthVersion::V1_1, AuthVersion::V1_3];

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

// Verify a request as the server would, trusting nothing but the public key and the client name.
fn server_verifies(
    public_key_pem: &str,
    client_name: &str,
    method: &str,
    path: &str,
    body: &[u8],
    headers: &HeaderMap,
) -> anyhow::Result<bool> {
    let version: AuthVersion = header(headers, "x-ops-sign")
        .rsplit("version=")
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(anyhow::Error::msg)?;
    let canonical = CanonicalRequest::new(
        version,
        method,
        path,
        body,
        header(headers, "x-ops-timestamp"),
        client_name,
        header(headers, "x-ops-server-api-version"),
    );
    if canonical.content_hash != header(headers, "x-ops-content-hash") {
        return Ok(false);
    }

    let public_key = PKey::public_key_from_pem(public_key_pem.as_bytes())?;
    let signature = reassemble(headers)?;
    Ok(signature::verify(
        &public_key,
        canonical.canonical_string().as_bytes(),
        &signature,
        version.signature_scheme(),
    )?)
}

#[test]
fn every_version_verifies() -> anyhow::Result<()> {
    let identity = Identity::from_rsa("tester", Rsa::generate(2048)?)?;
    let public_key = identity.public_key_pem()?;
    let body = br#"{"name":"web1","run_list":["recipe[nginx]"]}"#;

    for version in VERSIONS {
        let signer = RequestSigner::new(identity.clone(), version);
        let headers = signer.headers("POST", "/organizations/test/nodes", body, "2024-01-01T00:00:00Z")?;

        assert!(
            server_verifies(&public_key, "tester", "POST", "/organizations/test/nodes", body, &headers)?,
            "version {version} did not verify"
        );
        assert!(
            !server_verifies(&public_key, "tester", "POST", "/organizations/test/nodes", b"{}", &headers)?,
            "version {version} verified with a different body"
        );
        assert!(
            !server_verifies(&public_key, "tester", "PUT", "/organizations/test/nodes", body, &headers)?,
            "version {version} verified with a different method"
        );
        assert!(
            !server_verifies(&public_key, "tester", "POST", "/organizations/test/roles", body, &headers)?,
            "version {version} verified with a different path"
        );
        assert!(
            !server_verifies(&public_key, "impostor", "POST", "/organizations/test/nodes", body, &headers)?,
            "version {version} verified as a different client"
        );
    }
    Ok(())
}

#[test]
fn other_keys_do_not_verify() -> anyhow::Result<()> {
    let identity = Identity::from_rsa("tester", Rsa::generate(2048)?)?;
    let other = Identity::from_rsa("tester", Rsa::generate(2048)?)?;

    for version in VERSIONS {
        let headers = RequestSigner::new(identity.clone(), version).headers(
            "GET",
            "/organizations/test/nodes",
            b"",
            "2024-01-01T00:00:00Z",
        )?;
        assert!(!server_verifies(
            &other.public_key_pem()?,
            "tester",
            "GET",
            "/organizations/test/nodes",
            b"",
            &headers
        )?);
    }
    Ok(())
}

#[test]
fn wire_headers() -> anyhow::Result<()> {
    let identity = Identity::from_rsa("tester", Rsa::generate(2048)?)?;
    let headers = RequestSigner::new(identity.clone(), AuthVersion::V1_0)
        .with_chef_version("18.0.0")
        .headers("GET", "/organizations/test/nodes", b"", "2024-01-01T00:00:00Z")?;

    assert_eq!("application/json", header(&headers, "accept"));
    assert_eq!("18.0.0", header(&headers, "x-chef-version"));
    assert_eq!("tester", header(&headers, "x-ops-userid"));
    assert_eq!("2024-01-01T00:00:00Z", header(&headers, "x-ops-timestamp"));
    assert_eq!("algorithm=sha1;version=1.0", header(&headers, "x-ops-sign"));
    assert_eq!("2jmj7l5rSw0yVb/vlWAYkK/YBwk=", header(&headers, "x-ops-content-hash"));
    assert!(headers.get("method").is_none());

    // A 2048-bit signature is 344 base64 characters: five full chunks and one of 44.
    let chunks = (1..=6)
        .map(|index| header(&headers, &format!("x-ops-authorization-{index}")).len())
        .collect::<Vec<_>>();
    assert_eq!(vec![60, 60, 60, 60, 60, 44], chunks);
    assert!(headers.get("x-ops-authorization-7").is_none());

    let v13 = RequestSigner::new(identity, AuthVersion::V1_3).headers(
        "GET",
        "/organizations/test/nodes",
        b"",
        "2024-01-01T00:00:00Z",
    )?;
    assert_eq!("algorithm=sha256;version=1.3", header(&v13, "x-ops-sign"));
    assert_eq!(hash_base64(chefapi::digest::DigestAlgorithm::Sha256, b""), header(&v13, "x-ops-content-hash"));
    Ok(())
}

#[test]
fn canonical_string_for_known_request() {
    let canonical = CanonicalRequest::new(
        AuthVersion::V1_0,
        "GET",
        "/organizations/test/nodes",
        b"",
        "1990-12-31T15:59:60-08:00",
        "tester",
        "1",
    );
    assert_eq!(
        format!(
            "Method:GET\nHashed Path:{}\nX-Ops-Content-Hash:{}\nX-Ops-Timestamp:1990-12-31T15:59:60-08:00\nX-Ops-UserId:tester",
            hash_str("/organizations/test/nodes"),
            hash_str(""),
        ),
        canonical.canonical_string()
    );
}

#[test]
fn missing_chunk_fails() -> anyhow::Result<()> {
    let identity = Identity::from_rsa("tester", Rsa::generate(2048)?)?;
    let mut headers = RequestSigner::new(identity, AuthVersion::V1_0).headers(
        "GET",
        "/organizations/test/nodes",
        b"",
        "2024-01-01T00:00:00Z",
    )?;
    headers.remove("x-ops-authorization-3");

    assert!(matches!(
        reassemble(&headers),
        Err(SigningError::MalformedAuthorization(_))
    ));
    Ok(())
}

#[test]
fn signs_reqwest_requests() -> anyhow::Result<()> {
    let identity = Identity::from_rsa("tester", Rsa::generate(2048)?)?;
    let public_key = identity.public_key_pem()?;
    let signer = RequestSigner::new(identity, AuthVersion::V1_3);
    let body = br#"{"id":"db"}"#.to_vec();

    let client = reqwest::Client::new();
    let mut request = client
        .request(
            Method::PUT,
            "https://chef.example.com//organizations/test/data//secrets/db/",
        )
        .body(body.clone())
        .build()?;
    signer.sign_request(&mut request)?;

    let path = request.url().path().to_string();
    assert_eq!("/organizations/test/data/secrets/db", path);
    assert_eq!(canonical_path(&path), path);
    assert!(server_verifies(
        &public_key,
        "tester",
        "PUT",
        &path,
        &body,
        request.headers()
    )?);
    Ok(())
}
