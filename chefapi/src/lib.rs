// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# chefapi

A client for the [Chef Infra Server][1] REST API.

Every request to the Chef server is authenticated by signing a canonical description of the
request (method, path, body digest, timestamp, and client name) with the client's RSA private key
and sending the signature in a set of `X-Ops-Authorization-N` headers. The [`auth`] module
implements this signing protocol (versions 1.0, 1.1, and 1.3), and [`client::Client`] signs every
request it sends.

On top of the client, the [`vault`] module implements [chef-vault][2]: data bag items whose values
are encrypted with AES-256-GCM under a random shared secret, with a copy of that secret
RSA-encrypted for each client allowed to read the item.

## Components

* [`auth`]: client identities and request signing.
* [`client`]: the signed HTTP client and the data bag API.
* [`vault`]: encrypted vault items over any [`client::DataBagStore`].
* [`digest`]: the digest and checksum helpers used by the other modules.

## Crate features

* **cli** -
  Build the `chefapi-client` command-line tool and support loading TOML configuration files.
  This is a default feature.

[1]: https://docs.chef.io/server/api_chef_server/
[2]: https://github.com/chef/chef-vault
*/

pub mod auth;
pub mod client;
pub mod config;
pub mod digest;
pub mod error;
pub mod vault;

pub use auth::{AuthVersion, Identity};
pub use client::{Client, Config};
