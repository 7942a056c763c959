//! Module with the cluster description shared by every peer and the workload a CLI peer runs.

use crate::{process::ProcessId, RATE};
use serde::{Deserialize, Serialize};
use std::{error::Error, path::Path, time::Duration};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: ProcessId,
    pub address: String,
}

/// Fixed membership of the cluster. Ids must be exactly `1..=N`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub peers: Vec<PeerConfig>,
    #[serde(default = "default_initial_holder")]
    pub initial_holder: ProcessId,
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

fn default_initial_holder() -> ProcessId {
    ProcessId(1)
}

fn default_connect_retry_ms() -> u64 {
    200
}

fn default_connect_attempts() -> u32 {
    50
}

impl ClusterConfig {
    /// Function that builds a configuration with default settings, numbering `addresses`
    /// from 1.
    pub fn from_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            peers: addresses
                .into_iter()
                .enumerate()
                .map(|(i, address)| PeerConfig {
                    id: ProcessId(i + 1),
                    address: address.into(),
                })
                .collect(),
            initial_holder: default_initial_holder(),
            connect_retry_ms: default_connect_retry_ms(),
            connect_attempts: default_connect_attempts(),
        }
    }

    /// Function that reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_string(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_string(json: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(json)?)
    }

    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.peers.is_empty() {
            return Err("cluster has no peers".into());
        }

        let mut ids: Vec<usize> = self.peers.iter().map(|p| p.id.0).collect();
        ids.sort_unstable();
        if ids.iter().copied().ne(1..=self.peers.len()) {
            return Err(format!(
                "peer ids must be 1..={} without gaps or repeats, got {:?}",
                self.peers.len(),
                ids
            ));
        }

        if let Some(peer) = self.peers.iter().find(|p| p.address.trim().is_empty()) {
            return Err(format!("{} has an empty address", peer.id));
        }

        if !self.initial_holder.is_member(self.cluster_size()) {
            return Err(format!(
                "initial holder {} is not a member of the cluster",
                self.initial_holder
            ));
        }

        if self.connect_attempts == 0 {
            return Err("connect_attempts must be at least 1".into());
        }
        Ok(())
    }

    pub fn address_of(&self, id: ProcessId) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.address.as_str())
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

/// How often and for how long a CLI peer uses the critical section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub rounds: u32,
    /// Mean number of requests per second.
    pub rate: f64,
    pub hold_ms: u64,
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            rounds: 10,
            rate: RATE,
            hold_ms: 100,
            seed: 0,
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(format!("request rate must be positive, got {}", self.rate));
        }
        Ok(())
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}
