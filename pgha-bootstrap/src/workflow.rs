//! Persisted progress of the etcd bootstrap/join sequence.
//!
//! Joining members is order dependent (node 1 starts alone, then node 2 and
//! node 3 are added one at a time) but is carried out by an operator across
//! machines. The state file records how far that has progressed so that the
//! printed instructions never skip ahead.

use crate::common::{STATE_FILE, resolve};
use crate::error::BootstrapError;
use chrono::{DateTime, Utc};
use cmd_lib::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
    EnumIter,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ClusterState {
    New,
    Node1Started,
    Node2Joined,
    Node3Joined,
    Complete,
}

impl ClusterState {
    /// The only state this one may move to.
    pub fn next(self) -> Option<ClusterState> {
        let mut iter = ClusterState::iter().skip_while(|s| *s != self);
        iter.next();
        iter.next()
    }

    /// Whether the member with this 1-based ordinal is already part of the cluster.
    pub fn has_member(self, ordinal: usize) -> bool {
        match ordinal {
            1 => self >= ClusterState::Node1Started,
            2 => self >= ClusterState::Node2Joined,
            3 => self >= ClusterState::Node3Joined,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub state: ClusterState,
    pub updated_at: DateTime<Utc>,
}

pub struct WorkflowStore {
    path: PathBuf,
}

impl WorkflowStore {
    pub fn new(root: &Path) -> Self {
        Self {
            path: resolve(root, STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<WorkflowRecord>, Error> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::other(format!(
                    "Failed to read {}: {e}",
                    self.path.display()
                )));
            }
        };
        let record = toml::from_str(&content).map_err(|e| {
            Error::other(format!("TOML parse error in {}: {e}", self.path.display()))
        })?;
        Ok(Some(record))
    }

    pub fn state(&self) -> Result<ClusterState, Error> {
        Ok(self
            .load()?
            .map(|r| r.state)
            .unwrap_or(ClusterState::New))
    }

    /// Records `to` if it directly follows the current state.
    pub fn advance(&self, to: ClusterState) -> Result<WorkflowRecord, Error> {
        let from = self.state()?;
        let expected = from.next();
        if expected != Some(to) {
            return Err(BootstrapError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
                expected: expected
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no further transitions".to_string()),
            }
            .into());
        }

        let record = WorkflowRecord {
            state: to,
            updated_at: Utc::now(),
        };
        self.save(&record)?;
        info!("Cluster state: {from} -> {to}");
        Ok(record)
    }

    pub fn reset(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn save(&self, record: &WorkflowRecord) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string(record)
            .map_err(|e| Error::other(format!("Failed to serialize cluster state: {e}")))?;
        fs::write(&self.path, content)
    }
}
