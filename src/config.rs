//! Coordinator configuration: CLI flags merged over an optional JSON file.

use crate::error::BootstrapError;
use crate::matrix::Mode;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    name = "wfcoord",
    version,
    about = "Coordinator for distributed web-traffic measurement over VPN relays"
)]
pub struct Args {
    /// JSON config file; individual flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory to store collected samples in
    #[arg(long)]
    pub datadir: Option<PathBuf>,

    /// File listing the URLs to visit, one per line
    #[arg(long)]
    pub urllist: Option<PathBuf>,

    /// File listing the VPN relays to use, one hostname per line
    #[arg(long)]
    pub vpnlist: Option<PathBuf>,

    /// JSON file with VPN account credentials
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Number of samples to collect for each cell
    #[arg(long)]
    pub samples: Option<u32>,

    /// Number of visits per VPN connection, passed through to workers
    #[arg(long)]
    pub visits: Option<u32>,

    /// Host to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Accept plain-HTTP URLs in the URL list
    #[arg(long)]
    pub allow_http: bool,

    /// Skip the relay inventory check (offline operation)
    #[arg(long)]
    pub skip_relay_check: bool,

    /// Seed for the credential shuffle; OS entropy when omitted
    #[arg(long)]
    pub shuffle_seed: Option<u64>,
}

/// Size bounds for submitted artifacts, in bytes. Captures outside these
/// bounds are unusable and are declined without counting.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SampleLimits {
    pub min_pcap: usize,
    pub max_pcap: usize,
    pub min_png: usize,
}

impl Default for SampleLimits {
    fn default() -> Self {
        Self {
            min_pcap: 10 * 1024,
            max_pcap: 3 * 1024 * 1024,
            min_png: 10 * 1024,
        }
    }
}

/// Settings forwarded verbatim to workers in the `/setup` response.
/// The coordinator never interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerProfile {
    /// Extra seconds to keep the page open once it finished loading
    pub grace: f64,
    /// Minimum seconds to spend on a visit
    pub min_wait: f64,
    /// Maximum seconds to spend on a visit
    pub max_wait: f64,
    /// Virtual display size as `[width, height]`
    pub display_size: (u32, u32),
    pub fullscreen: bool,
    /// Seconds between browser start and capture start
    pub post_browser_pre_capture_wait: f64,
    /// Seconds between capture start and the visit
    pub post_packet_pre_visit_wait: f64,
    /// Shaping modes the worker should be prepared to toggle between
    pub daita: Vec<Mode>,
}

impl Default for WorkerProfile {
    fn default() -> Self {
        Self {
            grace: 0.0,
            min_wait: 5.0,
            max_wait: 20.0,
            display_size: (1920, 1080),
            fullscreen: true,
            post_browser_pre_capture_wait: 1.0,
            post_packet_pre_visit_wait: 1.0,
            daita: Mode::ALL.to_vec(),
        }
    }
}

/// File-side settings. Everything is optional; flags win on conflict.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    datadir: Option<PathBuf>,
    urllist: Option<PathBuf>,
    vpnlist: Option<PathBuf>,
    database: Option<PathBuf>,
    samples: Option<u32>,
    visits: Option<u32>,
    host: Option<String>,
    port: Option<u16>,
    allow_http: Option<bool>,
    skip_relay_check: Option<bool>,
    shuffle_seed: Option<u64>,
    limits: SampleLimits,
    worker: WorkerProfile,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub datadir: PathBuf,
    pub urllist: PathBuf,
    pub vpnlist: PathBuf,
    pub database: PathBuf,
    pub samples: u32,
    pub visits: u32,
    pub host: String,
    pub port: u16,
    pub allow_http: bool,
    pub skip_relay_check: bool,
    pub shuffle_seed: Option<u64>,
    pub limits: SampleLimits,
    pub worker: WorkerProfile,
}

impl Config {
    /// Merge flags over the optional config file and validate tunables.
    pub fn resolve(args: Args) -> Result<Self, BootstrapError> {
        let file = match &args.config {
            Some(path) => {
                let raw =
                    std::fs::read_to_string(path).map_err(|source| BootstrapError::ReadFile {
                        path: path.clone(),
                        source,
                    })?;
                serde_json::from_str::<FileConfig>(&raw).map_err(|source| {
                    BootstrapError::ParseConfig {
                        path: path.clone(),
                        source,
                    }
                })?
            }
            None => FileConfig::default(),
        };

        let samples = args.samples.or(file.samples).unwrap_or(100);
        if !(1..1000).contains(&samples) {
            return Err(BootstrapError::InvalidSamples(samples));
        }

        Ok(Self {
            datadir: args
                .datadir
                .or(file.datadir)
                .ok_or(BootstrapError::MissingSetting("datadir"))?,
            urllist: args
                .urllist
                .or(file.urllist)
                .ok_or(BootstrapError::MissingSetting("urllist"))?,
            vpnlist: args
                .vpnlist
                .or(file.vpnlist)
                .ok_or(BootstrapError::MissingSetting("vpnlist"))?,
            database: args
                .database
                .or(file.database)
                .ok_or(BootstrapError::MissingSetting("database"))?,
            samples,
            visits: args.visits.or(file.visits).unwrap_or(10),
            host: args
                .host
                .or(file.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: args.port.or(file.port).unwrap_or(5000),
            allow_http: args.allow_http || file.allow_http.unwrap_or(false),
            skip_relay_check: args.skip_relay_check || file.skip_relay_check.unwrap_or(false),
            shuffle_seed: args.shuffle_seed.or(file.shuffle_seed),
            limits: file.limits,
            worker: file.worker,
        })
    }
}
