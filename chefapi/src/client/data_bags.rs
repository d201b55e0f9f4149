// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Data bags: named collections of arbitrary JSON items.

use std::{collections::BTreeMap, future::Future};

use serde_json::{json, Map, Value};

use super::Client;
use crate::error::ClientError;

/// A data bag item: a JSON object with (at least) an `id` field.
pub type DataBagItem = Map<String, Value>;

/// Storage for data bags and their items.
///
/// [`Client`] implements this over the Chef server's `/data` endpoints. Errors use
/// [`ClientError::NotFound`] and [`ClientError::Conflict`] so callers can tell a missing or
/// existing object apart from other failures.
pub trait DataBagStore {
    /// List data bags, mapping each name to its URL.
    fn list_data_bags(
        &self,
    ) -> impl Future<Output = Result<BTreeMap<String, String>, ClientError>> + Send;

    /// Create an empty data bag.
    fn create_data_bag(&self, bag: &str) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// List the items in a data bag, mapping each item name to its URL.
    fn list_items(
        &self,
        bag: &str,
    ) -> impl Future<Output = Result<BTreeMap<String, String>, ClientError>> + Send;

    /// Create an item; its name is taken from the item's `id` field.
    fn create_item(
        &self,
        bag: &str,
        item: &DataBagItem,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn get_item(
        &self,
        bag: &str,
        name: &str,
    ) -> impl Future<Output = Result<DataBagItem, ClientError>> + Send;

    /// Replace an existing item.
    fn update_item(
        &self,
        bag: &str,
        name: &str,
        item: &DataBagItem,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn delete_item(
        &self,
        bag: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;
}

impl DataBagStore for Client {
    async fn list_data_bags(&self) -> Result<BTreeMap<String, String>, ClientError> {
        self.get(self.segments_url(&["data"])?).await
    }

    async fn create_data_bag(&self, bag: &str) -> Result<(), ClientError> {
        self.post::<_, Value>(self.segments_url(&["data"])?, &json!({ "name": bag }))
            .await
            .map(|_| ())
    }

    async fn list_items(&self, bag: &str) -> Result<BTreeMap<String, String>, ClientError> {
        self.get(self.segments_url(&["data", bag])?).await
    }

    async fn create_item(&self, bag: &str, item: &DataBagItem) -> Result<(), ClientError> {
        self.post::<_, Value>(self.segments_url(&["data", bag])?, item)
            .await
            .map(|_| ())
    }

    async fn get_item(&self, bag: &str, name: &str) -> Result<DataBagItem, ClientError> {
        self.get(self.segments_url(&["data", bag, name])?).await
    }

    async fn update_item(
        &self,
        bag: &str,
        name: &str,
        item: &DataBagItem,
    ) -> Result<(), ClientError> {
        self.put::<_, Value>(self.segments_url(&["data", bag, name])?, item)
            .await
            .map(|_| ())
    }

    async fn delete_item(&self, bag: &str, name: &str) -> Result<(), ClientError> {
        self.delete(self.segments_url(&["data", bag, name])?).await
    }
}
