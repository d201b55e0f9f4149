// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Vaults: data bag items encrypted for a specific set of clients.
//!
//! A vault item is stored as two data bag items in the vault's data bag. The primary item holds
//! the encrypted values, and `<item>_keys` holds a copy of the item's shared secret encrypted
//! for each client allowed to read it.
//!
//! Creating a vault item writes the keys item first and the primary item second. If the second
//! write fails, the keys item is left behind; nothing is rolled back, and callers that want to
//! retry from scratch should call [`VaultService::delete_item`], which tolerates either half
//! being missing.

use openssl::pkey::PKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use crate::{
    auth::Identity,
    client::{DataBagItem, DataBagStore},
    error::{ClientError, VaultError},
};

pub mod crypto;

use crypto::{EncryptedValue, SharedKey};

const ID: &str = "id";

/// Fields of the keys item that are not client entries.
const RESERVED_KEYS: [&str; 5] = [ID, "mode", "admins", "clients", "search_query"];

/// The name of the data bag item holding the encrypted secrets for `item`.
pub fn keys_item_name(item: &str) -> String {
    format!("{item}_keys")
}

/// The typed view of a keys item's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysMetadata {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub clients: Vec<String>,
    #[serde(default)]
    pub search_query: Value,
}

/// A vault item's keys item.
///
/// The raw JSON document is kept as-is so fields this crate doesn't know about survive being
/// written back; [`VaultKeys::metadata`] projects the known fields out of it.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultKeys {
    raw: DataBagItem,
}

impl VaultKeys {
    fn new(item: &str, admin: &str) -> Self {
        let mut raw = DataBagItem::new();
        raw.insert(ID.to_string(), Value::String(keys_item_name(item)));
        raw.insert("mode".to_string(), json!("default"));
        raw.insert("admins".to_string(), json!([admin]));
        raw.insert("clients".to_string(), json!([]));
        raw.insert("search_query".to_string(), json!([]));
        Self { raw }
    }

    /// Wrap a keys item loaded from the store.
    pub fn from_raw(raw: DataBagItem) -> Self {
        Self { raw }
    }

    /// The underlying JSON document.
    pub fn raw(&self) -> &DataBagItem {
        &self.raw
    }

    /// Decode the known metadata fields.
    pub fn metadata(&self) -> Result<KeysMetadata, VaultError> {
        Ok(serde_json::from_value(Value::Object(self.raw.clone()))?)
    }

    pub fn admins(&self) -> Result<Vec<String>, VaultError> {
        Ok(self.metadata()?.admins)
    }

    pub fn clients(&self) -> Result<Vec<String>, VaultError> {
        Ok(self.metadata()?.clients)
    }

    pub fn set_admins(&mut self, admins: Vec<String>) {
        self.raw.insert("admins".to_string(), json!(admins));
    }

    pub fn set_clients(&mut self, clients: Vec<String>) {
        self.raw.insert("clients".to_string(), json!(clients));
    }

    /// The base64-encoded, RSA-encrypted shared secret for `client`, if it has one.
    pub fn encrypted_secret(&self, client: &str) -> Option<&str> {
        if RESERVED_KEYS.contains(&client) {
            return None;
        }
        self.raw.get(client).and_then(Value::as_str)
    }

    /// The names of all clients holding a copy of the shared secret.
    pub fn authorized(&self) -> impl Iterator<Item = &str> {
        self.raw
            .iter()
            .filter(|(name, value)| !RESERVED_KEYS.contains(&name.as_str()) && value.is_string())
            .map(|(name, _)| name.as_str())
    }

    fn insert_secret(&mut self, client: &str, encrypted: String) -> Result<(), VaultError> {
        if RESERVED_KEYS.contains(&client) {
            return Err(VaultError::MalformedEnvelope(format!(
                "'{client}' is reserved and cannot be used as a client name"
            )));
        }
        self.raw.insert(client.to_string(), Value::String(encrypted));
        Ok(())
    }
}

/// A vault item as stored: encrypted values plus the keys needed to read them.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultItem {
    pub vault: String,
    pub name: String,
    /// The primary item, with every field except `id` encrypted.
    pub data: DataBagItem,
    pub keys: VaultKeys,
}

impl VaultItem {
    fn describe(&self) -> String {
        format!("{}/{}", self.vault, self.name)
    }

    /// Recover the AES key using `identity`'s entry in the keys item.
    pub fn shared_key(&self, identity: &Identity) -> Result<SharedKey, VaultError> {
        Ok(SharedKey::derive(&self.shared_secret(identity)?)?)
    }

    fn shared_secret(&self, identity: &Identity) -> Result<Vec<u8>, VaultError> {
        let encoded = self
            .keys
            .encrypted_secret(identity.client_name())
            .ok_or_else(|| VaultError::NotEncryptedWithYourKey {
                item: self.describe(),
            })?;
        crypto::decode_shared_secret(&identity.rsa()?, encoded)
    }

    /// Decrypt every value, returning them alongside the plaintext `id`.
    pub fn decrypt(&self, identity: &Identity) -> Result<DataBagItem, VaultError> {
        let key = self.shared_key(identity)?;
        self.data
            .iter()
            .map(|(field, value)| {
                let value = if field == ID {
                    value.clone()
                } else {
                    EncryptedValue::from_json(field, value)?.open(field, &key)?
                };
                Ok((field.clone(), value))
            })
            .collect()
    }

    /// Replace the item's values with `values` encrypted under the existing shared secret.
    ///
    /// Any `id` in `values` is ignored; the item keeps its own.
    pub fn encrypt(&mut self, identity: &Identity, values: &DataBagItem) -> Result<(), VaultError> {
        self.data = self.sealed(identity, values)?;
        Ok(())
    }

    // The encrypted form of `values`, leaving the item untouched.
    fn sealed(&self, identity: &Identity, values: &DataBagItem) -> Result<DataBagItem, VaultError> {
        let key = self.shared_key(identity)?;
        let mut data = DataBagItem::new();
        data.insert(ID.to_string(), Value::String(self.name.clone()));
        for (field, value) in values.iter().filter(|(field, _)| *field != ID) {
            let sealed = EncryptedValue::seal(&key, value)?;
            data.insert(field.clone(), serde_json::to_value(sealed)?);
        }
        Ok(data)
    }
}

/// Vault operations over a data bag store, performed as a single identity.
#[derive(Debug)]
pub struct VaultService<S> {
    store: S,
    identity: Identity,
}

impl<S: DataBagStore> VaultService<S> {
    pub fn new(store: S, identity: Identity) -> Self {
        Self { store, identity }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// List the data bags that contain at least one vault item.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<String>, VaultError> {
        let mut vaults = vec![];
        for bag in self.store.list_data_bags().await?.into_keys() {
            if !self.list_items(&bag).await?.is_empty() {
                vaults.push(bag);
            }
        }
        Ok(vaults)
    }

    /// List the vault items in `vault`: every item `X` for which `X_keys` also exists.
    #[instrument(skip(self))]
    pub async fn list_items(&self, vault: &str) -> Result<Vec<String>, VaultError> {
        let items = self.store.list_items(vault).await?;
        Ok(items
            .keys()
            .filter(|name| items.contains_key(&keys_item_name(name)))
            .cloned()
            .collect())
    }

    /// Create an empty vault item readable by this service's identity, which becomes its sole
    /// administrator.
    #[instrument(skip(self), fields(client = self.identity.client_name()))]
    pub async fn create_item(&self, vault: &str, item: &str) -> Result<VaultItem, VaultError> {
        match self.store.create_data_bag(vault).await {
            Ok(()) => tracing::info!("Created vault data bag"),
            Err(ClientError::Conflict(_)) => tracing::debug!("Vault data bag already exists"),
            Err(error) => return Err(error.into()),
        }

        let secret = crypto::generate_secret()?;
        let client_name = self.identity.client_name();
        let mut keys = VaultKeys::new(item, client_name);
        keys.insert_secret(
            client_name,
            crypto::encode_shared_secret(self.identity.private_key(), &secret)?,
        )?;
        self.store.create_item(vault, keys.raw()).await?;

        let mut data = DataBagItem::new();
        data.insert(ID.to_string(), Value::String(item.to_string()));
        self.store
            .create_item(vault, &data)
            .await
            .inspect_err(|error| {
                tracing::error!(
                    ?error,
                    keys_item = keys_item_name(item),
                    "Created keys item but not the primary item; the vault item is incomplete"
                );
            })?;
        tracing::info!("Created vault item");

        Ok(VaultItem {
            vault: vault.to_string(),
            name: item.to_string(),
            data,
            keys,
        })
    }

    /// Load a vault item and its keys.
    #[instrument(skip(self))]
    pub async fn get_item(&self, vault: &str, item: &str) -> Result<VaultItem, VaultError> {
        let data = self.store.get_item(vault, item).await?;
        let keys = self.store.get_item(vault, &keys_item_name(item)).await?;
        Ok(VaultItem {
            vault: vault.to_string(),
            name: item.to_string(),
            data,
            keys: VaultKeys::from_raw(keys),
        })
    }

    /// Encrypt `values` under the item's existing secret and store them, replacing the
    /// item's previous values.
    ///
    /// `item` is only changed once the store accepts the new values.
    #[instrument(skip(self, item, values), fields(vault = %item.vault, item = %item.name))]
    pub async fn update_item(
        &self,
        item: &mut VaultItem,
        values: &DataBagItem,
    ) -> Result<(), VaultError> {
        let data = item.sealed(&self.identity, values)?;
        self.store
            .update_item(&item.vault, &item.name, &data)
            .await?;
        item.data = data;
        tracing::info!(fields = values.len(), "Updated vault item");
        Ok(())
    }

    /// Decrypt an item's values with this service's identity.
    pub fn decrypt(&self, item: &VaultItem) -> Result<DataBagItem, VaultError> {
        item.decrypt(&self.identity)
    }

    /// Delete both halves of a vault item. Halves that are already gone are skipped.
    #[instrument(skip(self))]
    pub async fn delete_item(&self, vault: &str, item: &str) -> Result<(), VaultError> {
        for name in [keys_item_name(item), item.to_string()] {
            match self.store.delete_item(vault, &name).await {
                Ok(()) => tracing::debug!(name, "Deleted data bag item"),
                Err(error) if error.is_not_found() => {
                    tracing::warn!(name, "Data bag item was already deleted");
                }
                Err(error) => return Err(error.into()),
            }
        }
        tracing::info!("Deleted vault item");
        Ok(())
    }

    /// Give `client` its own copy of the item's shared secret and store the updated keys.
    ///
    /// `public_key_pem` is the client's PEM-encoded RSA public key. The caller must already be
    /// able to read the item. A client is listed as either an admin or a plain client, never
    /// both, so granting again with a different `admin` flag moves it between the lists.
    #[instrument(skip(self, item, public_key_pem), fields(vault = %item.vault, item = %item.name))]
    pub async fn grant(
        &self,
        item: &mut VaultItem,
        client: &str,
        public_key_pem: &[u8],
        admin: bool,
    ) -> Result<(), VaultError> {
        let secret = item.shared_secret(&self.identity)?;
        let public_key = PKey::public_key_from_pem(public_key_pem)?;
        let mut keys = item.keys.clone();
        keys.insert_secret(client, crypto::encode_shared_secret(&public_key, &secret)?)?;

        let mut metadata = keys.metadata()?;
        let (list, other) = if admin {
            (&mut metadata.admins, &mut metadata.clients)
        } else {
            (&mut metadata.clients, &mut metadata.admins)
        };
        other.retain(|name| name != client);
        if !list.iter().any(|name| name == client) {
            list.push(client.to_string());
        }
        if metadata.admins.is_empty() {
            return Err(VaultError::LastAdmin {
                item: item.describe(),
            });
        }
        keys.set_admins(metadata.admins);
        keys.set_clients(metadata.clients);

        self.save_keys(item, keys).await?;
        tracing::info!(admin, "Granted client access to vault item");
        Ok(())
    }

    /// Remove `client`'s copy of the shared secret and store the updated keys.
    ///
    /// The secret itself is not rotated, so a revoked client that kept a copy can still read
    /// values it already has.
    #[instrument(skip(self, item), fields(vault = %item.vault, item = %item.name))]
    pub async fn revoke(&self, item: &mut VaultItem, client: &str) -> Result<(), VaultError> {
        if RESERVED_KEYS.contains(&client) {
            return Err(VaultError::MalformedEnvelope(format!(
                "'{client}' is reserved and cannot be used as a client name"
            )));
        }
        let mut keys = item.keys.clone();
        let mut metadata = keys.metadata()?;
        metadata.admins.retain(|name| name != client);
        metadata.clients.retain(|name| name != client);
        let remaining = keys.authorized().filter(|name| *name != client).count();
        if metadata.admins.is_empty() || remaining == 0 {
            return Err(VaultError::LastAdmin {
                item: item.describe(),
            });
        }

        keys.raw.remove(client);
        keys.set_admins(metadata.admins);
        keys.set_clients(metadata.clients);

        self.save_keys(item, keys).await?;
        tracing::info!("Revoked client access to vault item");
        Ok(())
    }

    async fn save_keys(&self, item: &mut VaultItem, keys: VaultKeys) -> Result<(), VaultError> {
        self.store
            .update_item(&item.vault, &keys_item_name(&item.name), keys.raw())
            .await?;
        item.keys = keys;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use openssl::rsa::Rsa;

    use super::*;

    fn identity(name: &str) -> anyhow::Result<Identity> {
        Ok(Identity::from_rsa(name, Rsa::generate(2048)?)?)
    }

    fn item_for(identity: &Identity) -> anyhow::Result<VaultItem> {
        let secret = crypto::generate_secret()?;
        let mut keys = VaultKeys::new("passwords", identity.client_name());
        keys.insert_secret(
            identity.client_name(),
            crypto::encode_shared_secret(identity.private_key(), &secret)?,
        )?;
        Ok(VaultItem {
            vault: "secrets".to_string(),
            name: "passwords".to_string(),
            data: serde_json::from_value(json!({"id": "passwords"}))?,
            keys,
        })
    }

    #[test]
    fn new_keys_item_shape() -> anyhow::Result<()> {
        let keys = VaultKeys::new("passwords", "tester");
        let metadata = keys.metadata()?;
        assert_eq!("passwords_keys", metadata.id);
        assert_eq!(Some("default".to_string()), metadata.mode);
        assert_eq!(vec!["tester".to_string()], metadata.admins);
        assert!(metadata.clients.is_empty());
        assert_eq!(json!([]), metadata.search_query);
        assert_eq!(0, keys.authorized().count());
        Ok(())
    }

    #[test]
    fn unknown_keys_fields_survive() -> anyhow::Result<()> {
        let raw: DataBagItem = serde_json::from_value(json!({
            "id": "passwords_keys",
            "admins": ["tester"],
            "clients": ["web1"],
            "search_query": "role:web",
            "mode": "default",
            "tester": "c2VjcmV0",
            "future_field": {"nested": true},
        }))?;
        let mut keys = VaultKeys::from_raw(raw);
        keys.set_clients(vec!["web1".to_string(), "web2".to_string()]);

        assert_eq!(json!({"nested": true}), keys.raw()["future_field"]);
        assert_eq!(vec!["web1", "web2"], keys.clients()?);
        assert_eq!(json!("role:web"), keys.metadata()?.search_query);
        assert_eq!(Some("c2VjcmV0"), keys.encrypted_secret("tester"));
        assert_eq!(None, keys.encrypted_secret("mode"));
        assert_eq!(vec!["tester"], keys.authorized().collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn reserved_client_names_rejected() {
        let mut keys = VaultKeys::new("passwords", "tester");
        assert!(matches!(
            keys.insert_secret("admins", "c2VjcmV0".to_string()),
            Err(VaultError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn encrypt_then_decrypt() -> anyhow::Result<()> {
        let tester = identity("tester")?;
        let mut item = item_for(&tester)?;
        let values: DataBagItem = serde_json::from_value(json!({
            "id": "ignored",
            "db": "hunter2",
            "port": 5432,
            "replicas": ["a", "b"],
        }))?;

        item.encrypt(&tester, &values)?;
        assert_eq!(json!("passwords"), item.data["id"]);
        assert_eq!(json!(3), item.data["db"]["version"]);
        assert_ne!(json!("hunter2"), item.data["db"]);

        let decrypted = item.decrypt(&tester)?;
        assert_eq!(json!("passwords"), decrypted["id"]);
        assert_eq!(json!("hunter2"), decrypted["db"]);
        assert_eq!(json!(5432), decrypted["port"]);
        assert_eq!(json!(["a", "b"]), decrypted["replicas"]);
        Ok(())
    }

    #[test]
    fn other_identity_is_not_authorized() -> anyhow::Result<()> {
        let tester = identity("tester")?;
        let mut item = item_for(&tester)?;
        item.encrypt(&tester, &serde_json::from_value(json!({"db": "hunter2"}))?)?;

        let intruder = identity("intruder")?;
        assert!(matches!(
            item.decrypt(&intruder),
            Err(VaultError::NotEncryptedWithYourKey { item: name }) if name == "secrets/passwords"
        ));
        assert!(matches!(
            item.encrypt(&intruder, &DataBagItem::new()),
            Err(VaultError::NotEncryptedWithYourKey { .. })
        ));
        Ok(())
    }

    // A client entry holding a secret encrypted for someone else's key can't be decrypted.
    #[test]
    fn impersonation_fails() -> anyhow::Result<()> {
        let tester = identity("tester")?;
        let mut item = item_for(&tester)?;
        item.encrypt(&tester, &serde_json::from_value(json!({"db": "hunter2"}))?)?;
        let impostor = identity("tester")?;
        assert!(item.decrypt(&impostor).is_err());
        Ok(())
    }
}
