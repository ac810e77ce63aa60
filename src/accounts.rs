//! VPN credential pool with sticky one-shot assignment.

use crate::error::BootstrapError;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// One VPN credential, handed to exactly one worker identity.
///
/// The record is opaque to the coordinator: fields are passed through to the
/// worker, which embeds them into its VPN daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_token: String,
    pub device_id: String,
    pub device_name: String,
    pub device_private_key: String,
    pub device_ipv4_address: String,
    pub device_ipv6_address: String,
}

#[derive(Deserialize)]
struct AccountDatabase {
    accounts: Vec<Account>,
}

/// Pool of unassigned credentials plus the worker→credential map.
///
/// A credential moves `available → allocated[worker]` on the worker's first
/// `/setup` and never moves back; repeated `/setup` calls from the same
/// identity return the same credential.
#[derive(Debug, Default)]
pub struct AccountPool {
    available: Vec<Account>,
    allocated: HashMap<String, Account>,
}

impl AccountPool {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            available: accounts,
            allocated: HashMap::new(),
        }
    }

    /// Load the JSON credential database (`{"accounts": [...]}`).
    pub fn load(path: &Path) -> Result<Self, BootstrapError> {
        let raw = std::fs::read_to_string(path).map_err(|source| BootstrapError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let db: AccountDatabase =
            serde_json::from_str(&raw).map_err(|source| BootstrapError::ParseDatabase {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Loaded {} accounts from {}", db.accounts.len(), path.display());
        Ok(Self::new(db.accounts))
    }

    /// Randomise assignment order. Done once at boot; the resulting order is
    /// stable for the lifetime of the process.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.available.shuffle(rng);
    }

    /// Sticky assignment: returns the worker's credential, drawing a fresh
    /// one from the pool on first contact. `None` when the pool is empty.
    pub fn assign(&mut self, worker: &str) -> Option<&Account> {
        if !self.allocated.contains_key(worker) {
            let account = self.available.pop()?;
            self.allocated.insert(worker.to_string(), account);
        }
        self.allocated.get(worker)
    }

    pub fn allocated_len(&self) -> usize {
        self.allocated.len()
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    /// Credentials loaded at boot, assigned or not.
    pub fn total(&self) -> usize {
        self.available.len() + self.allocated.len()
    }
}
