//! Peer directory.
//!
//! Tracks two disjoint lists of peers keyed by id:
//! - candidates, which the overlay dials to top up its connections
//! - grey peers, demoted after a failed connect and never picked again
//!
//! The directory is stored as `{"peers": [...], "grey_peers": [...]}` with
//! each entry in `id@ip:port` form. Storage failures never take the overlay
//! down; [`PeerDirectory::load`] and [`PeerDirectory::persist`] log and move on.

use crate::controller::PeerListSource;
use crate::peer::PeerEntry;
use crate::{NetworkError, NetworkResult};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default location of the directory file, relative to the working directory.
pub const DEFAULT_STATE_FILE: &str = "tmp/peerstate.json";

/// On-disk form.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedDirectory {
    #[serde(default)]
    peers: Vec<String>,
    #[serde(default)]
    grey_peers: Vec<String>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    candidates: Vec<PeerEntry>,
    grey: Vec<PeerEntry>,
}

impl DirectoryState {
    fn knows(&self, id: &str) -> bool {
        self.candidates.iter().any(|p| p.id == id) || self.grey.iter().any(|p| p.id == id)
    }

    fn add_candidate(&mut self, entry: PeerEntry) -> bool {
        if !entry.has_id() || self.knows(&entry.id) {
            return false;
        }
        self.candidates.push(entry);
        true
    }

    fn add_grey(&mut self, entry: PeerEntry) -> bool {
        if !entry.has_id() || self.grey.iter().any(|p| p.id == entry.id) {
            return false;
        }
        self.candidates.retain(|p| p.id != entry.id);
        self.grey.push(entry);
        true
    }
}

/// Candidate and grey peer lists with file persistence.
#[derive(Debug)]
pub struct PeerDirectory {
    path: PathBuf,
    state: RwLock<DirectoryState>,
}

impl PeerDirectory {
    /// Create an empty directory stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(DirectoryState::default()),
        }
    }

    /// Storage path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add unknown peers to the candidates.
    ///
    /// Entries without an id, or already present in either list, are
    /// skipped. Returns the number added.
    pub fn import<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = PeerEntry>,
    {
        let mut state = self.state.write();
        entries
            .into_iter()
            .filter(|entry| state.add_candidate(entry.clone()))
            .count()
    }

    /// Move a candidate to the grey list. Returns whether it moved.
    pub fn demote(&self, id: &str) -> bool {
        let mut state = self.state.write();
        let Some(pos) = state.candidates.iter().position(|p| p.id == id) else {
            return false;
        };
        let entry = state.candidates.remove(pos);
        state.grey.push(entry);
        true
    }

    /// A uniformly random candidate.
    pub fn pick(&self) -> Option<PeerEntry> {
        let state = self.state.read();
        if state.candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..state.candidates.len());
        state.candidates.get(index).cloned()
    }

    /// A uniformly random candidate whose id is not in `exclude`.
    pub fn pick_excluding(&self, exclude: &HashSet<String>) -> Option<PeerEntry> {
        let state = self.state.read();
        let eligible: Vec<&PeerEntry> = state
            .candidates
            .iter()
            .filter(|p| !exclude.contains(&p.id))
            .collect();
        eligible.choose(&mut rand::thread_rng()).map(|p| (*p).clone())
    }

    /// Up to `limit` random candidates.
    pub fn sample(&self, limit: usize) -> Vec<PeerEntry> {
        let state = self.state.read();
        state
            .candidates
            .choose_multiple(&mut rand::thread_rng(), limit)
            .cloned()
            .collect()
    }

    pub fn candidates(&self) -> Vec<PeerEntry> {
        self.state.read().candidates.clone()
    }

    pub fn grey(&self) -> Vec<PeerEntry> {
        self.state.read().grey.clone()
    }

    pub fn candidate_count(&self) -> usize {
        self.state.read().candidates.len()
    }

    pub fn grey_count(&self) -> usize {
        self.state.read().grey.len()
    }

    /// Whether `id` is a candidate.
    pub fn contains(&self, id: &str) -> bool {
        self.state.read().candidates.iter().any(|p| p.id == id)
    }

    /// Whether `id` is grey.
    pub fn is_grey(&self, id: &str) -> bool {
        self.state.read().grey.iter().any(|p| p.id == id)
    }

    /// Merge the stored directory into memory.
    ///
    /// A missing file loads nothing. Returns the number of entries merged.
    pub fn try_load(&self) -> NetworkResult<usize> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No peer directory file");
            return Ok(0);
        }

        let content = fs::read_to_string(&self.path).map_err(|e| {
            NetworkError::Directory(format!("read {}: {}", self.path.display(), e))
        })?;
        let stored: PersistedDirectory = serde_json::from_str(&content).map_err(|e| {
            NetworkError::Directory(format!("parse {}: {}", self.path.display(), e))
        })?;

        let mut state = self.state.write();
        let mut merged = 0;
        for entry in parse_entries(&stored.peers) {
            if state.add_candidate(entry) {
                merged += 1;
            }
        }
        for entry in parse_entries(&stored.grey_peers) {
            if state.add_grey(entry) {
                merged += 1;
            }
        }

        debug!(
            path = %self.path.display(),
            merged,
            candidates = state.candidates.len(),
            grey = state.grey.len(),
            "Loaded peer directory"
        );
        Ok(merged)
    }

    /// Write the directory to storage, creating the parent directory.
    pub fn try_persist(&self) -> NetworkResult<()> {
        let stored = {
            let state = self.state.read();
            PersistedDirectory {
                peers: state.candidates.iter().map(|p| p.to_string()).collect(),
                grey_peers: state.grey.iter().map(|p| p.to_string()).collect(),
            }
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    NetworkError::Directory(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }

        let content = serde_json::to_string_pretty(&stored)?;
        fs::write(&self.path, content).map_err(|e| {
            NetworkError::Directory(format!("write {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }

    /// Best-effort [`try_load`](Self::try_load).
    pub fn load(&self) -> bool {
        match self.try_load() {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Failed to load peer directory");
                false
            }
        }
    }

    /// Best-effort [`try_persist`](Self::try_persist).
    pub fn persist(&self) -> bool {
        match self.try_persist() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist peer directory");
                false
            }
        }
    }
}

impl PeerListSource for PeerDirectory {
    fn peer_list(&self, limit: usize) -> Vec<PeerEntry> {
        self.sample(limit)
    }
}

fn parse_entries(raw: &[String]) -> impl Iterator<Item = PeerEntry> + '_ {
    raw.iter().filter_map(|text| match text.parse::<PeerEntry>() {
        Ok(entry) => Some(entry),
        Err(e) => {
            debug!(entry = %text, error = %e, "Skipping stored peer");
            None
        }
    })
}
