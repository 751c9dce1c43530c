//! Where each worker can be reached.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use routing::Identity;

/// One worker's HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    pub identity: Identity,
    /// Base URL; capability names are appended as path segments.
    pub base_url: String,
    /// Key sent as `X-API-Key` when the caller supplies none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl WorkerEndpoint {
    /// `{base_url}/{path}`, with exactly one slash between them.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Configured worker endpoints, keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    endpoints: HashMap<Identity, WorkerEndpoint>,
}

impl WorkerRegistry {
    /// Later entries replace earlier ones with the same identity.
    pub fn new(endpoints: impl IntoIterator<Item = WorkerEndpoint>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.identity.clone(), e))
                .collect(),
        }
    }

    pub fn endpoint(&self, worker: &Identity) -> Option<&WorkerEndpoint> {
        self.endpoints.get(worker)
    }

    /// Every registered identity, sorted.
    pub fn identities(&self) -> Vec<Identity> {
        let mut ids: Vec<Identity> = self.endpoints.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
