//! Experiment matrix — cells, completion counters, pending set.
//!
//! The matrix is the cross product `relays × modes × urls`. Each cell carries
//! a completion counter with a process-wide target (`samples`); a cell is
//! *open* while its counter is below the target. The pending set is the
//! materialised set of open cells and is kept in lockstep with the counters:
//! every mutation goes through [`Matrix::record_accepted`] or
//! [`Matrix::set_counter`], both of which re-establish
//! `pending = { cell : counter < samples }` before returning.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Traffic-shaping mode, carried end-to-end as `"on"` / `"off"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Off,
    On,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Off, Mode::On];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::On => "on",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Mode::Off),
            "on" => Ok(Mode::On),
            _ => Err(()),
        }
    }
}

/// One `(relay, mode, url)` coordinate of the experiment matrix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cell {
    pub relay: String,
    pub mode: Mode,
    pub url: String,
}

impl Cell {
    pub fn new(relay: impl Into<String>, mode: Mode, url: impl Into<String>) -> Self {
        Self {
            relay: relay.into(),
            mode,
            url: url.into(),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.relay, self.mode, self.url)
    }
}

/// Completion state for every cell of the experiment.
///
/// URLs, relays and the URL→line mapping are fixed at construction and
/// immutable afterwards. Counters only move up.
#[derive(Debug)]
pub struct Matrix {
    urls: Vec<String>,
    lines: HashMap<String, usize>,
    relays: Vec<String>,
    samples: u32,
    counters: HashMap<Cell, u32>,
    pending: HashSet<Cell>,
}

impl Matrix {
    /// Build a fresh matrix with all counters at zero and every cell open.
    ///
    /// `line(url)` is the position of the URL in `urls`, so the input order
    /// is load-bearing: it must match the on-disk directory numbering.
    pub fn new(urls: Vec<String>, relays: Vec<String>, samples: u32) -> Self {
        let lines = urls
            .iter()
            .enumerate()
            .map(|(i, u)| (u.clone(), i))
            .collect();

        let mut counters = HashMap::new();
        let mut pending = HashSet::new();
        for relay in &relays {
            for mode in Mode::ALL {
                for url in &urls {
                    let cell = Cell::new(relay.clone(), mode, url.clone());
                    counters.insert(cell.clone(), 0);
                    pending.insert(cell);
                }
            }
        }

        Self {
            urls,
            lines,
            relays,
            samples,
            counters,
            pending,
        }
    }

    /// Stable integer index of a URL, fixed at boot.
    pub fn line(&self, url: &str) -> Option<usize> {
        self.lines.get(url).copied()
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn contains(&self, cell: &Cell) -> bool {
        self.counters.contains_key(cell)
    }

    pub fn counter(&self, cell: &Cell) -> Option<u32> {
        self.counters.get(cell).copied()
    }

    pub fn is_open(&self, cell: &Cell) -> bool {
        self.pending.contains(cell)
    }

    pub fn open_cells(&self) -> &HashSet<Cell> {
        &self.pending
    }

    /// All `(relay, mode)` pairs that still have at least one open cell.
    pub fn open_pairs(&self) -> HashSet<(String, Mode)> {
        self.pending
            .iter()
            .map(|c| (c.relay.clone(), c.mode))
            .collect()
    }

    /// Open URLs for one `(relay, mode)` pair.
    pub fn open_urls_for(&self, relay: &str, mode: Mode) -> Vec<&str> {
        self.pending
            .iter()
            .filter(|c| c.relay == relay && c.mode == mode)
            .map(|c| c.url.as_str())
            .collect()
    }

    /// Count one accepted sample.
    ///
    /// Caller must hold the cell open; the counter never crosses `samples`.
    /// Closes the cell (removes it from pending) when the target is reached.
    /// Returns the new counter value.
    pub fn record_accepted(&mut self, cell: &Cell) -> u32 {
        debug_assert!(self.is_open(cell));
        let counter = self
            .counters
            .get_mut(cell)
            .expect("record_accepted on unknown cell");
        *counter = (*counter + 1).min(self.samples);
        let counter = *counter;
        if counter >= self.samples {
            self.pending.remove(cell);
        }
        counter
    }

    /// Overwrite a counter from recovery.
    ///
    /// Values above `samples` are clamped for quota purposes; the caller is
    /// expected to have logged the surplus. Pending membership is updated to
    /// match the new value.
    pub fn set_counter(&mut self, cell: &Cell, value: u32) {
        let Some(counter) = self.counters.get_mut(cell) else {
            return;
        };
        *counter = value.min(self.samples);
        if *counter >= self.samples {
            self.pending.remove(cell);
        } else {
            self.pending.insert(cell.clone());
        }
    }

    pub fn open_len(&self) -> usize {
        self.pending.len()
    }

    /// Sum of all counters.
    pub fn total_collected(&self) -> u64 {
        self.counters.values().map(|&c| c as u64).sum()
    }

    /// Full campaign size: `modes × samples × urls × relays`.
    pub fn total_target(&self) -> u64 {
        Mode::ALL.len() as u64
            * self.samples as u64
            * self.urls.len() as u64
            * self.relays.len() as u64
    }
}
