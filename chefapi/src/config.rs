// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{env, path::PathBuf};

#[cfg(feature = "cli")]
use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{auth::Identity, error::KeyError};

/// Credentials required to sign requests.
///
/// If the key path is relative, it is assumed to be relative to the `$CREDENTIALS_DIRECTORY`
/// environment variable, which lets systemd decrypt the key for just this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// The name of the API client (or user) the Chef server knows the key by.
    pub client_name: String,
    /// The path to the PEM-encoded RSA private key for `client_name`.
    ///
    /// # Example
    ///
    /// To prepare the encrypted configuration:
    ///
    /// ```bash
    /// systemd-creds encrypt /secure/ramfs/client.pem /etc/credstore.encrypted/chefapi.client_key
    /// ```
    pub client_key: PathBuf,
}

impl Credentials {
    /// Load the private key and pair it with the client name.
    pub fn identity(&self) -> Result<Identity, KeyError> {
        Identity::from_file(self.client_name.clone(), &self.client_key)
    }

    /// Fix up a relative key path to use the provided credentials directory.
    ///
    /// # Errors
    ///
    /// If the referenced key doesn't exist, an error is returned.
    pub fn with_credentials_dir(
        &mut self,
        credentials_dir: &std::path::Path,
    ) -> anyhow::Result<()> {
        if self.client_key.is_absolute() {
            tracing::warn!(
                client_key = self.client_key.display().to_string(),
                "Path to client key is absolute; consider using systemd credentials"
            );
        } else {
            self.client_key = credentials_dir.join(&self.client_key);
            if !self.client_key.exists() {
                return Err(anyhow::anyhow!(
                    "No client key named '{}' found in credentials directory",
                    self.client_key.display()
                ));
            }
        }

        Ok(())
    }
}

// Parse the TOML file at `path`; on failure, show the user what a valid file looks like.
#[cfg(feature = "cli")]
fn read_config<T>(path: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("can't read the configuration file {}", path.display()))?;
    toml::from_str(&contents)
        .inspect_err(|error| {
            eprintln!("{} is not a valid client configuration:\n{error}", path.display());
            eprintln!("A valid configuration looks like this:\n\n{}", T::default());
        })
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

/// Find and parse the client configuration.
///
/// An explicit `path` always wins and must exist. Otherwise `default` is looked up under
/// `$CONFIGURATION_DIRECTORY`, and when no file is there either, `T::default()` is used.
///
/// # Errors
///
/// Returns an error if the chosen file can't be read or doesn't parse.
#[cfg(feature = "cli")]
pub fn load_config<T>(path: Option<PathBuf>, default: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let path = match path {
        Some(path) => Some(path),
        None => match env::var_os("CONFIGURATION_DIRECTORY") {
            Some(directory) => {
                Some(PathBuf::from(directory).join(default)).filter(|path| path.is_file())
            }
            None => {
                tracing::debug!("CONFIGURATION_DIRECTORY is unset");
                None
            }
        },
    };

    match path {
        Some(path) => {
            let config = read_config(&path)?;
            tracing::info!(path = %path.display(), "Loaded client configuration");
            Ok(config)
        }
        None => {
            tracing::warn!(
                default = %default.display(),
                "No client configuration found, falling back to built-in defaults"
            );
            Ok(T::default())
        }
    }
}
