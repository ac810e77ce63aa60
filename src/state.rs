//! Shared experiment state and the policies that mutate it.
//!
//! All mutable state lives in one [`Experiment`] behind a single
//! `tokio::sync::Mutex`. The HTTP layer serves requests concurrently, but
//! every handler takes the lock once for its whole critical section, so all
//! observable outcomes are equivalent to a sequential schedule. Work
//! selection, credential assignment and sample accounting are each cheap
//! under the lock; the only slow path is the three-file disk write of an
//! accepted submission, which must be atomic with the counter update anyway.

use crate::accounts::{Account, AccountPool};
use crate::config::Config;
use crate::error::BootstrapError;
use crate::matrix::{Cell, Matrix, Mode};
use crate::relays;
use crate::store::ArtifactStore;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Application state shared across handlers: the immutable configuration and
/// the lock-guarded experiment.
pub struct Coordinator {
    pub config: Config,
    pub experiment: Mutex<Experiment>,
}

impl Coordinator {
    /// Run the full boot sequence and wrap the result for the HTTP layer.
    pub async fn bootstrap(config: Config) -> Result<Self, BootstrapError> {
        let experiment = Experiment::bootstrap(&config).await?;
        Ok(Self {
            config,
            experiment: Mutex::new(experiment),
        })
    }
}

/// Result of a submission commit, decided under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Sample persisted under this number; counter advanced.
    Accepted(u64),
    /// Cell already reached its target; nothing written.
    AlreadyDone,
    /// The `(relay, mode, url)` tuple is not a cell of this experiment.
    UnknownCell,
}

/// `/status` response body.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub total_to_collect: u64,
    pub total_collected: u64,
    pub elapsed: f64,
    pub last_update: f64,
    pub unique_clients: Vec<String>,
    pub allocated_accounts: String,
}

/// All mutable experiment state. Mutated only under the coordinator lock.
pub struct Experiment {
    matrix: Matrix,
    accounts: AccountPool,
    store: ArtifactStore,
    started_at: Instant,
    last_update: Instant,
    unique_clients: HashSet<String>,
}

impl Experiment {
    pub fn new(matrix: Matrix, accounts: AccountPool, store: ArtifactStore) -> Self {
        let now = Instant::now();
        Self {
            matrix,
            accounts,
            store,
            started_at: now,
            last_update: now,
            unique_clients: HashSet::new(),
        }
    }

    // =========================================================================
    // BOOT
    // =========================================================================

    /// Build the experiment from configuration: load and validate inputs,
    /// scaffold or recover the artifact tree, shuffle the credential pool.
    pub async fn bootstrap(config: &Config) -> Result<Self, BootstrapError> {
        let urls = load_url_list(&config.urllist, config.allow_http)?;
        info!("Loaded {} URLs from {}", urls.len(), config.urllist.display());

        let relay_names = load_relay_list(&config.vpnlist)?;
        info!(
            "Loaded {} relays from {}",
            relay_names.len(),
            config.vpnlist.display()
        );

        if config.skip_relay_check {
            warn!("Relay inventory check SKIPPED (--skip-relay-check)");
        } else {
            let inventory = relays::fetch_inventory(relays::INVENTORY_URL).await?;
            relays::validate(&relay_names, &inventory)?;
        }

        let mut matrix = Matrix::new(urls, relay_names, config.samples);
        let store = ArtifactStore::new(&config.datadir);

        if config.datadir.exists() {
            let counts = store
                .recover(&matrix)
                .map_err(|source| BootstrapError::DataDir {
                    path: config.datadir.clone(),
                    source,
                })?;
            for (cell, count) in counts {
                if count > config.samples {
                    warn!(
                        "Cell {} holds {} samples, target is {}; surplus kept on disk",
                        cell, count, config.samples
                    );
                }
                matrix.set_counter(&cell, count);
            }
        }
        // Fill in any cell directory that does not exist yet, so sample
        // writes never race against directory creation.
        store
            .scaffold(matrix.relays(), matrix.urls().len())
            .map_err(|source| BootstrapError::DataDir {
                path: config.datadir.clone(),
                source,
            })?;

        info!(
            "Data directory {} holds {} samples, {} to go",
            config.datadir.display(),
            matrix.total_collected(),
            matrix.total_target() - matrix.total_collected()
        );

        let mut accounts = AccountPool::load(&config.database)?;
        let mut rng = match config.shuffle_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        accounts.shuffle(&mut rng);

        Ok(Self::new(matrix, accounts, store))
    }

    // =========================================================================
    // POLICY (all called with the coordinator lock held)
    // =========================================================================

    /// Track a worker identity for `/status` reporting.
    pub fn record_client(&mut self, id: &str) {
        self.unique_clients.insert(id.to_string());
    }

    /// Sticky credential assignment; `None` when the pool is exhausted.
    pub fn assign_account(&mut self, worker: &str) -> Option<Account> {
        self.accounts.assign(worker).cloned()
    }

    /// Pick the next `(relay, mode)` pair for a worker.
    ///
    /// The worker's current pair is excluded whenever any other open pair
    /// exists; when it is the only open pair it is handed out again rather
    /// than starving the tail of the campaign. `None` means the campaign is
    /// complete for every pair.
    pub fn pick_pair(&self, current_relay: &str, current_mode: Mode) -> Option<(String, Mode)> {
        let mut pairs: Vec<(String, Mode)> = self.matrix.open_pairs().into_iter().collect();
        if pairs.is_empty() {
            return None;
        }
        if pairs.len() > 1 {
            pairs.retain(|(relay, mode)| !(relay == current_relay && *mode == current_mode));
        }
        pairs.choose(&mut rand::thread_rng()).cloned()
    }

    /// Pick a uniformly random open URL for the pair, or `None` when the
    /// pair is exhausted and the worker should rotate.
    pub fn pick_url(&self, relay: &str, mode: Mode) -> Option<String> {
        let urls = self.matrix.open_urls_for(relay, mode);
        urls.choose(&mut rand::thread_rng()).map(|u| u.to_string())
    }

    /// Commit one submission: allocate a sample number, write the three
    /// files, then advance the counter.
    ///
    /// The counter only moves after the write succeeds, so an I/O error
    /// leaves the cell open; any files that did land are reconciled by the
    /// pcap count at the next boot.
    pub async fn submit(
        &mut self,
        cell: &Cell,
        png: &[u8],
        pcap: &[u8],
        metadata: &serde_json::Value,
    ) -> io::Result<SubmitOutcome> {
        let Some(line) = self.matrix.line(&cell.url) else {
            return Ok(SubmitOutcome::UnknownCell);
        };
        if !self.matrix.contains(cell) {
            return Ok(SubmitOutcome::UnknownCell);
        }
        if !self.matrix.is_open(cell) {
            return Ok(SubmitOutcome::AlreadyDone);
        }

        let dir = self.store.cell_dir(&cell.relay, cell.mode, line);
        let sample = self.store.allocate_sample_number(&dir).await?;
        self.store
            .write_sample(&dir, sample, png, pcap, metadata)
            .await?;

        let counter = self.matrix.record_accepted(cell);
        self.last_update = Instant::now();

        if counter >= self.matrix.samples() {
            info!(
                "Done with {}, {} cells remain open",
                cell,
                self.matrix.open_len()
            );
        }
        Ok(SubmitOutcome::Accepted(sample))
    }

    /// Snapshot for `/status`.
    pub fn status(&self) -> StatusReport {
        let mut unique_clients: Vec<String> = self.unique_clients.iter().cloned().collect();
        unique_clients.sort();
        StatusReport {
            total_to_collect: self.matrix.total_target(),
            total_collected: self.matrix.total_collected(),
            elapsed: self.started_at.elapsed().as_secs_f64(),
            last_update: self.last_update.elapsed().as_secs_f64(),
            unique_clients,
            allocated_accounts: format!(
                "{}/{}",
                self.accounts.allocated_len(),
                self.accounts.total()
            ),
        }
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }
}

/// Read the URL list: one URL per line, blank lines skipped. URLs must be
/// unique and HTTPS (HTTP accepted only when `allow_http` is set).
pub fn load_url_list(path: &Path, allow_http: bool) -> Result<Vec<String>, BootstrapError> {
    let raw = std::fs::read_to_string(path).map_err(|source| BootstrapError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let mut urls = Vec::new();
    let mut seen = HashSet::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !seen.insert(line.to_string()) {
            return Err(BootstrapError::DuplicateUrl(line.to_string()));
        }
        if line.starts_with("https://") {
            urls.push(line.to_string());
        } else if line.starts_with("http://") {
            if !allow_http {
                return Err(BootstrapError::NonHttpsUrl(line.to_string()));
            }
            urls.push(line.to_string());
        } else {
            return Err(BootstrapError::MalformedUrl(line.to_string()));
        }
    }

    if urls.is_empty() {
        return Err(BootstrapError::EmptyUrlList);
    }
    Ok(urls)
}

/// Read the relay list: one hostname per line, blank lines skipped.
pub fn load_relay_list(path: &Path) -> Result<Vec<String>, BootstrapError> {
    let raw = std::fs::read_to_string(path).map_err(|source| BootstrapError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let relays: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    if relays.is_empty() {
        return Err(BootstrapError::EmptyRelayList);
    }
    Ok(relays)
}
