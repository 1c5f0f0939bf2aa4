// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The revert step: abandons the target cluster and brings the source
//! cluster back into service.
//!
//! Revert works after a failed initialize or execute, however far either
//! got. Finalize is the point of no return: once it has started
//! publishing directories, revert refuses to run. The directory restores
//! use the same idempotent transition protocol as finalize, so moves that
//! never happened are silently no-ops.

use std::io;
use tokio::sync::mpsc;

use step_engine::{Outcome, StatusEvent};
use upgrade_common::{RenamePair, transition};

use crate::directories::{self, archive_path, batch_by_host};

use super::{Hub, HubError};

impl Hub {
    pub async fn revert(
        &self,
        sender: mpsc::Sender<StatusEvent>,
        confirmed: bool,
    ) -> Result<(), HubError> {
        Self::confirm(confirmed)?;
        let mut runner = self.begin("revert", sender).await?;
        let store = self.config().substep_store();

        // Once finalize has begun, archived directories cannot be told
        // apart from ones that were already published over.
        if store.read_step("finalize").await?.is_some() {
            return Err(HubError::FinalizeStarted);
        }

        // If execute never recorded any progress the source cluster was
        // never touched and is still running. Restoring (or restarting) it
        // would be wrong; only the target cluster and the upgrade
        // machinery need dismantling.
        let execute_started = store.read_step("execute").await?.is_some();
        if !execute_started {
            runner.only_run([
                "start_agents",
                "delete_target_cluster",
                "delete_segment_state_dirs",
                "stop_agents",
            ]);
        }

        // Connections do not survive an orchestrator restart, so agents
        // are (re)started on every invocation.
        runner.always_run("start_agents", || self.start_agents()).await;
        runner
            .run("delete_target_cluster", || self.delete_target_cluster())
            .await;
        runner
            .run("restore_source_dirs", || self.restore_source_dirs())
            .await;
        runner.run("restore_catalog", || self.restore_catalog()).await;
        runner
            .run("start_source_cluster", || self.start_source_cluster())
            .await;
        runner
            .run("delete_segment_state_dirs", || {
                self.delete_segment_state_dirs()
            })
            .await;
        runner.run("stop_agents", || self.stop_agents()).await;

        Ok(runner.finish()?)
    }

    /// Removes the target cluster's data directories everywhere: the
    /// coordinator's locally, the segments' through their agents. A
    /// directory that is already gone is a success.
    async fn delete_target_cluster(&self) -> anyhow::Result<Outcome> {
        let target = &self.config().coordinator.target_data_dir;
        match tokio::fs::remove_dir_all(target).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to remove {target}")));
            }
        }

        let batches = batch_by_host(self.config().segments.iter().map(
            |segment| {
                (segment.hostname.clone(), segment.target_data_dir.clone())
            },
        ));
        if batches.is_empty() {
            return Ok(Outcome::Complete);
        }
        directories::delete_directories(&self.log, self.pool(), batches)
            .await?;
        Ok(Outcome::Complete)
    }

    /// Undoes finalize's directory publication: every archived source
    /// directory moves back into place. If finalize never archived a
    /// directory the restore is a no-op for it.
    async fn restore_source_dirs(&self) -> anyhow::Result<Outcome> {
        let coordinator = &self.config().coordinator;
        transition::transition_pair(
            &archive_path(&coordinator.source_data_dir),
            None,
            &coordinator.source_data_dir,
        )?;

        let batches = batch_by_host(self.config().segments.iter().map(
            |segment| {
                (
                    segment.hostname.clone(),
                    RenamePair::new(
                        archive_path(&segment.source_data_dir),
                        segment.source_data_dir.clone(),
                    ),
                )
            },
        ));
        if batches.is_empty() {
            return Ok(Outcome::Complete);
        }
        directories::rename_directories(&self.log, self.pool(), batches)
            .await?;
        Ok(Outcome::Complete)
    }

    /// The in-place catalog upgrade modifies the source coordinator's
    /// system tables; restore them from the backup taken before execute.
    async fn restore_catalog(&self) -> anyhow::Result<Outcome> {
        self.cluster_command(&[
            "restore",
            "--coordinator-data-dir",
            self.config().coordinator.source_data_dir.as_str(),
        ])
        .await?;
        Ok(Outcome::Complete)
    }

    async fn start_source_cluster(&self) -> anyhow::Result<Outcome> {
        self.cluster_command(&[
            "start",
            "--coordinator-data-dir",
            self.config().coordinator.source_data_dir.as_str(),
        ])
        .await?;
        Ok(Outcome::Complete)
    }
}
