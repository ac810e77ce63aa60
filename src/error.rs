//! Boot-time error types.

use std::path::PathBuf;
use thiserror::Error;

/// Anything that can abort startup.
///
/// These are surfaced once from `main` and terminate the process; after the
/// listener is up the only failure channels are per-request status codes.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("missing required setting `{0}` (flag or config file)")]
    MissingSetting(&'static str),

    #[error("samples must be in range 1..1000, got {0}")]
    InvalidSamples(u32),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("credential database {path}: {source}")]
    ParseDatabase {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("URL list is empty")]
    EmptyUrlList,

    #[error("URL list contains duplicate: {0}")]
    DuplicateUrl(String),

    #[error("URL {0} is not HTTPS (pass --allow-http to accept HTTP)")]
    NonHttpsUrl(String),

    #[error("URL {0} is neither HTTP nor HTTPS")]
    MalformedUrl(String),

    #[error("relay list is empty")]
    EmptyRelayList,

    #[error("relay inventory fetch failed: {0}")]
    InventoryFetch(#[from] reqwest::Error),

    #[error("relays not present in the inventory: {}", .0.join(", "))]
    UnknownRelays(Vec<String>),

    #[error("relays without DAITA support: {}", .0.join(", "))]
    RelaysWithoutDaita(Vec<String>),

    #[error("data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
