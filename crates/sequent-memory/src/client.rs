//! A namespaced, in-process document store: the reference
//! `ReadModelClientFactory` implementation ingestors project into in tests
//! and local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sequent_core::{CasingPolicy, ReadModelClientFactory};
use serde_json::Value;
use tokio::sync::Mutex;

/// A projection target: documents grouped into named collections, each
/// keyed by an application-chosen id. Namespacing (one `InMemoryClient` per
/// read-model generation) is handled by [`InMemoryClientFactory::make`];
/// this type itself only stores documents.
pub struct InMemoryClient {
    pub namespace: String,
    collections: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryClient {
    fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            collections: Mutex::new(HashMap::new()),
        }
    }

    pub async fn put(&self, collection: &str, id: impl Into<String>, document: Value) {
        let mut collections = self.collections.lock().await;
        collections.entry(collection.to_string()).or_default().insert(id.into(), document);
    }

    pub async fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections.lock().await.get(collection).and_then(|docs| docs.get(id)).cloned()
    }

    pub async fn delete(&self, collection: &str, id: &str) {
        if let Some(docs) = self.collections.lock().await.get_mut(collection) {
            docs.remove(id);
        }
    }

    /// Snapshot of every document in `collection`, in no particular order.
    pub async fn all(&self, collection: &str) -> Vec<Value> {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections.lock().await.get(collection).map(HashMap::len).unwrap_or(0)
    }
}

/// Idempotent registry of [`InMemoryClient`]s keyed by namespace, mirroring
/// `InMemoryTopicFactory`'s idempotent `make` contract.
pub struct InMemoryClientFactory {
    naming_convention: CasingPolicy,
    suffix_separator: String,
    clients: Mutex<HashMap<String, Arc<InMemoryClient>>>,
}

impl Default for InMemoryClientFactory {
    fn default() -> Self {
        Self {
            naming_convention: CasingPolicy::Kebab,
            suffix_separator: "-".to_string(),
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl InMemoryClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_naming_convention(mut self, naming_convention: CasingPolicy) -> Self {
        self.naming_convention = naming_convention;
        self
    }

    pub fn with_suffix_separator(mut self, suffix_separator: impl Into<String>) -> Self {
        self.suffix_separator = suffix_separator.into();
        self
    }
}

#[async_trait]
impl ReadModelClientFactory for InMemoryClientFactory {
    type Client = InMemoryClient;

    fn naming_convention(&self) -> CasingPolicy {
        self.naming_convention
    }

    fn suffix_separator(&self) -> &str {
        &self.suffix_separator
    }

    async fn make(&self, namespace: &str) -> anyhow::Result<Arc<InMemoryClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(namespace) {
            return Ok(client.clone());
        }
        let client = Arc::new(InMemoryClient::new(namespace));
        clients.insert(namespace.to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_roundtrips_a_document() {
        let client = InMemoryClient::new("users-abc123");
        client.put("users", "1", json!({"name": "Ada"})).await;
        assert_eq!(client.get("users", "1").await, Some(json!({"name": "Ada"})));
    }

    #[tokio::test]
    async fn delete_removes_a_document() {
        let client = InMemoryClient::new("users-abc123");
        client.put("users", "1", json!({"name": "Ada"})).await;
        client.delete("users", "1").await;
        assert_eq!(client.get("users", "1").await, None);
    }

    #[tokio::test]
    async fn make_is_idempotent_per_namespace() {
        let factory = InMemoryClientFactory::new();
        let a = factory.make("projection-abc").await.unwrap();
        a.put("users", "1", json!({"name": "Ada"})).await;
        let b = factory.make("projection-abc").await.unwrap();
        assert_eq!(b.get("users", "1").await, Some(json!({"name": "Ada"})));
    }

    #[tokio::test]
    async fn distinct_namespaces_do_not_share_storage() {
        let factory = InMemoryClientFactory::new();
        let a = factory.make("projection-a").await.unwrap();
        let b = factory.make("projection-b").await.unwrap();
        a.put("users", "1", json!({"name": "Ada"})).await;
        assert_eq!(b.get("users", "1").await, None);
    }
}
