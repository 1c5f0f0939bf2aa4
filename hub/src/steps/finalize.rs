// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The finalize step: the target cluster takes over the source's
//! directories and ports, and the upgrade machinery is dismantled.
//!
//! Every directory move goes through the idempotent transition protocol,
//! so a finalize interrupted at any point can simply be run again.

use futures::FutureExt;
use tokio::sync::mpsc;

use step_engine::{Outcome, StatusEvent};
use upgrade_common::{RenamePair, transition};

use crate::agent::PortAssignment;
use crate::broker::HostBatches;
use crate::directories::{
    self, archive_path, batch_by_host, delete_state_directories,
};

use super::{Hub, HubError};

impl Hub {
    pub async fn finalize(
        &self,
        sender: mpsc::Sender<StatusEvent>,
        confirmed: bool,
    ) -> Result<(), HubError> {
        Self::confirm(confirmed)?;
        let mut runner = self.begin("finalize", sender).await?;

        // Connections do not survive an orchestrator restart, so agents
        // are (re)started on every invocation.
        runner.always_run("start_agents", || self.start_agents()).await;
        runner
            .always_run("shutdown_target_cluster", || {
                self.shutdown_target_cluster()
            })
            .await;
        runner
            .run("update_data_directories", || self.update_data_directories())
            .await;
        runner
            .run("delete_segment_mirrors", || self.delete_segment_mirrors())
            .await;
        runner.run("reconfigure_ports", || self.reconfigure_ports()).await;
        runner
            .run("delete_segment_state_dirs", || {
                self.delete_segment_state_dirs()
            })
            .await;
        runner.run("stop_agents", || self.stop_agents()).await;

        Ok(runner.finish()?)
    }

    async fn shutdown_target_cluster(&self) -> anyhow::Result<Outcome> {
        self.cluster_command(&[
            "stop",
            "--coordinator-data-dir",
            self.config().coordinator.target_data_dir.as_str(),
        ])
        .await?;
        Ok(Outcome::Complete)
    }

    /// Archives every source data directory and publishes the target
    /// directory into its place: the coordinator locally, the segments
    /// through their agents.
    async fn update_data_directories(&self) -> anyhow::Result<Outcome> {
        let coordinator = &self.config().coordinator;
        transition::transition_pair(
            &coordinator.source_data_dir,
            Some(&coordinator.target_data_dir),
            &archive_path(&coordinator.source_data_dir),
        )?;

        directories::rename_directories(
            &self.log,
            self.pool(),
            self.segment_rename_batches(),
        )
        .await?;
        Ok(Outcome::Complete)
    }

    /// Per-host rename batches implementing the transition protocol for
    /// each primary segment: archive the source, then publish the target
    /// into the vacated path. Order within a batch matters; the agent
    /// applies it as given.
    fn segment_rename_batches(&self) -> HostBatches<RenamePair> {
        batch_by_host(self.config().segments.iter().flat_map(|segment| {
            let host = segment.hostname.clone();
            [
                (
                    host.clone(),
                    RenamePair::new(
                        segment.source_data_dir.clone(),
                        archive_path(&segment.source_data_dir),
                    ),
                ),
                (
                    host,
                    RenamePair::new(
                        segment.target_data_dir.clone(),
                        segment.source_data_dir.clone(),
                    ),
                ),
            ]
        }))
    }

    /// Mirror directories are not promoted; they are deleted. Segments
    /// without mirrors contribute nothing, and their hosts are never
    /// contacted.
    async fn delete_segment_mirrors(&self) -> anyhow::Result<Outcome> {
        let batches = batch_by_host(self.config().segments.iter().filter_map(
            |segment| {
                match (&segment.mirror_hostname, &segment.mirror_data_dir) {
                    (Some(host), Some(dir)) => {
                        Some((host.clone(), dir.clone()))
                    }
                    _ => None,
                }
            },
        ));
        if batches.is_empty() {
            return Ok(Outcome::Skipped);
        }
        directories::delete_directories(&self.log, self.pool(), batches)
            .await?;
        Ok(Outcome::Complete)
    }

    /// After publication the target cluster lives in the source's
    /// directories; move it onto the source's ports as well.
    async fn reconfigure_ports(&self) -> anyhow::Result<Outcome> {
        let coordinator = &self.config().coordinator;
        self.cluster_command(&[
            "reconfigure",
            "--data-dir",
            coordinator.source_data_dir.as_str(),
            "--port",
            &coordinator.port.to_string(),
        ])
        .await?;

        let batches = batch_by_host(self.config().segments.iter().map(
            |segment| {
                (
                    segment.hostname.clone(),
                    PortAssignment {
                        data_dir: segment.source_data_dir.clone(),
                        port: segment.port,
                    },
                )
            },
        ));
        crate::broker::fan_out(&self.log, self.pool(), batches, |client, assignments| {
            async move { Ok(client.reconfigure_data_dirs(&assignments).await?) }
                .boxed()
        })
        .await?;
        Ok(Outcome::Complete)
    }

    pub(super) async fn delete_segment_state_dirs(
        &self,
    ) -> anyhow::Result<Outcome> {
        delete_state_directories(
            &self.log,
            self.pool(),
            &self.config().segment_hosts(),
            &self.config().state_dir,
        )
        .await?;
        Ok(Outcome::Complete)
    }

    pub(super) async fn stop_agents(&self) -> anyhow::Result<Outcome> {
        self.pool().stop_all().await?;
        Ok(Outcome::Complete)
    }
}
