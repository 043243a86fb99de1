//! Paired secondaries, keyed by their self-reported instance id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteClient {
    pub ip: String,
    /// Port the secondary announced for its own engine.
    pub port: Option<u16>,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry(BTreeMap<String, RemoteClient>);

impl Registry {
    /// Record (or refresh) a secondary at connect time. Returns `true` when
    /// the stored entry changed.
    pub fn record(&mut self, instance_id: &str, client: RemoteClient) -> bool {
        match self.0.get(instance_id) {
            Some(existing) if *existing == client => false,
            _ => {
                self.0.insert(instance_id.to_string(), client);
                true
            }
        }
    }

    pub fn remove(&mut self, instance_id: &str) -> Option<RemoteClient> {
        self.0.remove(instance_id)
    }

    pub fn get(&self, instance_id: &str) -> Option<&RemoteClient> {
        self.0.get(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.0.contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `[[instance_id, {ip, port, hostname}], ...]`, the shape the admin
    /// panel lists.
    pub fn entries(&self) -> Vec<(&str, &RemoteClient)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }
}
