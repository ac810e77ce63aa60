//! wfcoord — coordinator for distributed web-traffic measurement.
//!
//! A central server hands each remote worker a VPN credential, rotates it
//! across `(relay, shaping-mode)` pairs, assigns URLs to visit, and collects
//! one screenshot + packet capture + metadata triple per visit until every
//! cell of the experiment matrix holds the target number of samples.

pub mod accounts;
pub mod config;
pub mod error;
pub mod http;
pub mod matrix;
pub mod relays;
pub mod state;
pub mod store;

pub use accounts::{Account, AccountPool};
pub use config::{Config, SampleLimits, WorkerProfile};
pub use error::BootstrapError;
pub use matrix::{Cell, Matrix, Mode};
pub use state::{Coordinator, Experiment, SubmitOutcome};
pub use store::ArtifactStore;
