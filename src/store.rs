//! On-disk artifact store.
//!
//! Layout: `root/<relay>/<line>_<mode>/<N>.{png,pcap,json}` where `<line>` is
//! the URL's index in the input list and `<mode>` is `on` or `off`. One
//! accepted visit is the triple of sibling files sharing the stem `N`.
//!
//! The `.pcap` file is the recovery witness: a sample counts toward a cell's
//! quota iff its `.pcap` exists. A crash between the three writes therefore
//! self-heals on the next boot — either the pcap made it to disk and the
//! sample counts, or it did not and the visit is re-collected.

use crate::matrix::{Cell, Matrix, Mode};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Root of the artifact tree plus path arithmetic for cells.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all samples for one cell.
    pub fn cell_dir(&self, relay: &str, mode: Mode, line: usize) -> PathBuf {
        self.root.join(relay).join(format!("{line}_{mode}"))
    }

    /// Create every cell directory that does not exist yet.
    ///
    /// Idempotent; used both for a fresh tree and to fill gaps after
    /// recovery so a later sample write never fails on a missing parent.
    pub fn scaffold(&self, relays: &[String], url_count: usize) -> io::Result<()> {
        for relay in relays {
            for mode in Mode::ALL {
                for line in 0..url_count {
                    std::fs::create_dir_all(self.cell_dir(relay, mode, line))?;
                }
            }
        }
        Ok(())
    }

    /// Rebuild per-cell sample counts from the tree by counting `.pcap`
    /// files. Read-only; directories that do not map onto a known cell are
    /// logged and skipped.
    pub fn recover(&self, matrix: &Matrix) -> io::Result<HashMap<Cell, u32>> {
        let relays: HashSet<&str> = matrix.relays().iter().map(String::as_str).collect();
        let mut counts = HashMap::new();

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let relay = entry.file_name();
            let Some(relay) = relay.to_str() else {
                warn!("Skipping non-UTF-8 directory {:?}", entry.path());
                continue;
            };
            if !relays.contains(relay) {
                warn!("Skipping unknown relay directory {}", entry.path().display());
                continue;
            }

            for cell_entry in std::fs::read_dir(entry.path())? {
                let cell_entry = cell_entry?;
                if !cell_entry.file_type()?.is_dir() {
                    continue;
                }
                let name = cell_entry.file_name();
                let Some((line, mode)) = name.to_str().and_then(parse_cell_dir) else {
                    warn!(
                        "Skipping unrecognised cell directory {}",
                        cell_entry.path().display()
                    );
                    continue;
                };
                let Some(url) = matrix.urls().get(line) else {
                    warn!(
                        "Skipping out-of-range cell directory {}",
                        cell_entry.path().display()
                    );
                    continue;
                };

                let pcaps = count_pcaps(&cell_entry.path())?;
                debug!(
                    "Recovered {} samples from {}",
                    pcaps,
                    cell_entry.path().display()
                );
                counts.insert(Cell::new(relay, mode, url.clone()), pcaps);
            }
        }

        Ok(counts)
    }

    /// Smallest non-negative integer with no `<N>.png` in the directory.
    ///
    /// Existing numbers need not be contiguous; the only contract is that
    /// the returned number collides with nothing already on disk.
    pub async fn allocate_sample_number(&self, dir: &Path) -> io::Result<u64> {
        let mut taken = HashSet::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            if let Some(n) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                taken.insert(n);
            }
        }
        Ok((0..).find(|n| !taken.contains(n)).unwrap_or(0))
    }

    /// Persist one sample as the three sibling files.
    ///
    /// Metadata is stored pretty-printed. Partial writes are possible on
    /// error and are reconciled at the next boot via the pcap count.
    pub async fn write_sample(
        &self,
        dir: &Path,
        sample: u64,
        png: &[u8],
        pcap: &[u8],
        metadata: &serde_json::Value,
    ) -> io::Result<()> {
        let stem = dir.join(sample.to_string());
        tokio::fs::write(stem.with_extension("png"), png).await?;
        tokio::fs::write(stem.with_extension("pcap"), pcap).await?;
        let pretty = serde_json::to_string_pretty(metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(stem.with_extension("json"), pretty).await?;
        Ok(())
    }
}

/// Parse a `<line>_<mode>` cell directory name.
fn parse_cell_dir(name: &str) -> Option<(usize, Mode)> {
    let (line, mode) = name.rsplit_once('_')?;
    Some((line.parse().ok()?, mode.parse().ok()?))
}

fn count_pcaps(dir: &Path) -> io::Result<u32> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("pcap") {
            count += 1;
        }
    }
    Ok(count)
}
