// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persisted substep status file.
//!
//! One JSON object maps step names to substep names to statuses:
//!
//! ```json
//! {
//!   "initialize": {
//!     "start_agents": "complete",
//!     "check_disk_space": "failed"
//!   }
//! }
//! ```
//!
//! Every write rewrites the whole map through a temp file in the same
//! directory followed by a rename, so a crash mid-write can never leave a
//! corrupted or partially-written file behind.
//!
//! The store does no locking. Exactly one orchestrator runs per state
//! directory; that exclusivity is the caller's convention to enforce, and
//! the engine is the only writer within that process.

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::io;

use crate::events::Status;

pub type StatusMap = BTreeMap<String, BTreeMap<String, Status>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The status file does not exist. Distinct from an empty store: an
    /// empty store is a valid file containing an empty object.
    #[error("substep status file not found at {path}")]
    NotFound { path: Utf8PathBuf },

    #[error("failed to read substep status file {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("substep status file {path} is malformed")]
    Deserialize {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },

    #[error("failed to write substep status file {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
}

/// File-backed mapping of (step, substep) to [`Status`].
#[derive(Clone, Debug)]
pub struct SubstepStore {
    path: Utf8PathBuf,
}

impl SubstepStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Creates an empty status file if none exists yet. Called once when a
    /// step begins; after this, a missing file is an error.
    pub async fn ensure(&self) -> Result<(), StoreError> {
        match self.load().await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound { .. }) => {
                self.persist(&StatusMap::new()).await
            }
            Err(err) => Err(err),
        }
    }

    /// Returns the persisted status of one substep.
    ///
    /// A step or substep that was never written reads back as
    /// [`Status::Unknown`]; only a missing or malformed file is an error.
    pub async fn read(
        &self,
        step: &str,
        substep: &str,
    ) -> Result<Status, StoreError> {
        let map = self.load().await?;
        Ok(map
            .get(step)
            .and_then(|substeps| substeps.get(substep))
            .copied()
            .unwrap_or(Status::Unknown))
    }

    /// Returns every persisted substep of `step`, or `None` if the step
    /// was never started.
    pub async fn read_step(
        &self,
        step: &str,
    ) -> Result<Option<BTreeMap<String, Status>>, StoreError> {
        let map = self.load().await?;
        Ok(map.get(step).cloned())
    }

    /// Persists the status of one substep.
    ///
    /// [`Status::Skipped`] is stored as [`Status::Complete`]: a skip is a
    /// deliberate, permanent outcome, not a retry candidate.
    pub async fn write(
        &self,
        step: &str,
        substep: &str,
        status: Status,
    ) -> Result<(), StoreError> {
        let status = match status {
            Status::Skipped => Status::Complete,
            other => other,
        };
        let mut map = self.load().await?;
        map.entry(step.to_owned())
            .or_default()
            .insert(substep.to_owned(), status);
        self.persist(&map).await
    }

    async fn load(&self) -> Result<StatusMap, StoreError> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { path: self.path.clone() });
            }
            Err(err) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    err,
                });
            }
        };
        serde_json::from_slice(&contents).map_err(|err| {
            StoreError::Deserialize { path: self.path.clone(), err }
        })
    }

    async fn persist(&self, map: &StatusMap) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(map)
            .expect("a StatusMap always serializes");
        let write_err = |err| StoreError::Write { path: self.path.clone(), err };
        // On first use the state directory itself may not exist yet.
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        // Write-temp-then-rename in the same directory, so the swap is a
        // single atomic rename on the same filesystem.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &contents).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(write_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    fn store_in(tmp: &Utf8TempDir) -> SubstepStore {
        SubstepStore::new(tmp.path().join("substeps.json"))
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let tmp = Utf8TempDir::new().unwrap();
        let store = store_in(&tmp);
        assert!(matches!(
            store.read("initialize", "start_agents").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn ensure_creates_missing_parent_directories() {
        // The state directory does not exist before the first step of the
        // first run.
        let tmp = Utf8TempDir::new().unwrap();
        let store =
            SubstepStore::new(tmp.path().join("state").join("substeps.json"));
        store.ensure().await.unwrap();
        store
            .write("initialize", "start_agents", Status::Complete)
            .await
            .unwrap();
        assert_eq!(
            store.read("initialize", "start_agents").await.unwrap(),
            Status::Complete
        );
    }

    #[tokio::test]
    async fn round_trip() {
        let tmp = Utf8TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.ensure().await.unwrap();

        store
            .write("initialize", "start_agents", Status::Running)
            .await
            .unwrap();
        assert_eq!(
            store.read("initialize", "start_agents").await.unwrap(),
            Status::Running
        );

        // Unwritten entries on an existing store are Unknown, not errors.
        assert_eq!(
            store.read("initialize", "check_disk_space").await.unwrap(),
            Status::Unknown
        );
        assert_eq!(
            store.read("finalize", "stop_agents").await.unwrap(),
            Status::Unknown
        );
    }

    #[tokio::test]
    async fn skipped_persists_as_complete() {
        let tmp = Utf8TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.ensure().await.unwrap();
        store
            .write("execute", "upgrade_standby", Status::Skipped)
            .await
            .unwrap();
        assert_eq!(
            store.read("execute", "upgrade_standby").await.unwrap(),
            Status::Complete
        );
    }

    #[tokio::test]
    async fn read_step_reports_whether_started() {
        let tmp = Utf8TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.ensure().await.unwrap();
        assert_eq!(store.read_step("execute").await.unwrap(), None);

        store
            .write("execute", "shutdown_source", Status::Complete)
            .await
            .unwrap();
        let substeps = store.read_step("execute").await.unwrap().unwrap();
        assert_eq!(substeps.get("shutdown_source"), Some(&Status::Complete));
    }

    #[tokio::test]
    async fn malformed_file_is_a_decode_error() {
        let tmp = Utf8TempDir::new().unwrap();
        let store = store_in(&tmp);
        std::fs::write(store.path(), "not json").unwrap();
        assert!(matches!(
            store.read("initialize", "start_agents").await,
            Err(StoreError::Deserialize { .. })
        ));
    }

    #[tokio::test]
    async fn file_is_human_readable() {
        let tmp = Utf8TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.ensure().await.unwrap();
        store
            .write("revert", "restore_source", Status::Failed)
            .await
            .unwrap();
        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert!(contents.contains("\"revert\""));
        assert!(contents.contains("\"restore_source\": \"failed\""));
    }
}
