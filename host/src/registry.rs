//! Registry of live remote attendees, updated by the join/leave drains
//! and snapshotted by the admin RPC.

use std::collections::HashMap;

use anyhow::bail;
use parking_lot::RwLock;

use crate::api::Client;

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; a duplicate id is a programming error upstream
    /// and is rejected.
    pub fn add(&self, client: Client) -> anyhow::Result<()> {
        let mut clients = self.clients.write();
        if clients.contains_key(&client.id) {
            bail!("client {} is already connected", client.id);
        }
        clients.insert(client.id.clone(), client);
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Option<Client> {
        self.clients.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().get(id).cloned()
    }

    /// Snapshot of the live clients, ordered by id for stable output.
    pub fn clients(&self) -> Vec<Client> {
        let mut all: Vec<Client> = self.clients.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> Client {
        Client {
            id: id.into(),
            addr: "203.0.113.7:9922".into(),
            version: "SSH-2.0-OpenSSH_9.6".into(),
            public_key_fingerprint: "SHA256:abcdef".into(),
        }
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let registry = ClientRegistry::new();
        registry.add(client("a")).unwrap();
        assert!(registry.add(client("a")).is_err());
        k9::assert_equal!(registry.len(), 1);
    }

    #[test]
    fn delete_then_get_returns_none() {
        let registry = ClientRegistry::new();
        registry.add(client("a")).unwrap();
        assert!(registry.delete("a").is_some());
        assert!(registry.get("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn clients_snapshot_is_sorted() {
        let registry = ClientRegistry::new();
        registry.add(client("b")).unwrap();
        registry.add(client("a")).unwrap();
        let ids: Vec<String> = registry.clients().into_iter().map(|c| c.id).collect();
        k9::assert_equal!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
