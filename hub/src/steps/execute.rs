// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The execute step: the actual data upgrade, node by node.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use step_engine::{Outcome, StatusEvent};
use upgrade_common::AggregateError;

use super::{Hub, HubError};

impl Hub {
    pub async fn execute(
        &self,
        sender: mpsc::Sender<StatusEvent>,
        confirmed: bool,
    ) -> Result<(), HubError> {
        Self::confirm(confirmed)?;
        let mut runner = self.begin("execute", sender).await?;

        // The operator may have restarted the source cluster since a
        // previous attempt, so stopping it can never be skipped.
        runner
            .always_run("shutdown_source_cluster", || {
                self.shutdown_source_cluster()
            })
            .await;
        runner
            .run("upgrade_coordinator", || self.upgrade_coordinator())
            .await;
        runner
            .run("copy_coordinator_to_segments", || {
                self.copy_coordinator_to_segments()
            })
            .await;
        runner
            .run("upgrade_primary_segments", || {
                self.upgrade_primary_segments()
            })
            .await;
        runner
            .run("start_target_cluster", || self.start_target_cluster())
            .await;

        Ok(runner.finish()?)
    }

    async fn shutdown_source_cluster(&self) -> anyhow::Result<Outcome> {
        self.cluster_command(&[
            "stop",
            "--coordinator-data-dir",
            self.config().coordinator.source_data_dir.as_str(),
        ])
        .await?;
        Ok(Outcome::Complete)
    }

    async fn upgrade_coordinator(&self) -> anyhow::Result<Outcome> {
        let coordinator = &self.config().coordinator;
        self.runner
            .run(
                "pg_upgrade",
                &[
                    "--old-datadir",
                    coordinator.source_data_dir.as_str(),
                    "--new-datadir",
                    coordinator.target_data_dir.as_str(),
                ],
            )
            .await?;
        Ok(Outcome::Complete)
    }

    /// Seeds every segment's target directory with the upgraded
    /// coordinator catalog. One transfer per segment, all hosts in
    /// flight at once, failures aggregated.
    async fn copy_coordinator_to_segments(&self) -> anyhow::Result<Outcome> {
        if self.config().segments.is_empty() {
            return Ok(Outcome::Skipped);
        }
        let source = format!(
            "{}/",
            self.config().coordinator.target_data_dir
        );
        let mut tasks = JoinSet::new();
        for segment in &self.config().segments {
            let runner = Arc::clone(&self.runner);
            let source = source.clone();
            let dest = format!(
                "{}:{}",
                segment.hostname, segment.target_data_dir
            );
            let host = segment.hostname.clone();
            tasks.spawn(async move {
                runner
                    .run("rsync", &["--archive", "--delete", &source, &dest])
                    .await
                    .map_err(|err| {
                        anyhow::Error::new(err)
                            .context(format!("host {host}"))
                    })
            });
        }

        let mut errors = AggregateError::new();
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined.expect("copy task panicked") {
                errors.push(err);
            }
        }
        errors.into_result()?;
        Ok(Outcome::Complete)
    }

    async fn upgrade_primary_segments(&self) -> anyhow::Result<Outcome> {
        if self.config().segments.is_empty() {
            return Ok(Outcome::Skipped);
        }
        let mut tasks = JoinSet::new();
        for segment in &self.config().segments {
            let runner = Arc::clone(&self.runner);
            let host = segment.hostname.clone();
            let remote = format!(
                "pg_upgrade --old-datadir {} --new-datadir {}",
                segment.source_data_dir, segment.target_data_dir
            );
            tasks.spawn(async move {
                runner.run("ssh", &[&host, &remote]).await.map_err(|err| {
                    anyhow::Error::new(err).context(format!("host {host}"))
                })
            });
        }

        let mut errors = AggregateError::new();
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined.expect("upgrade task panicked") {
                errors.push(err);
            }
        }
        errors.into_result()?;
        Ok(Outcome::Complete)
    }

    async fn start_target_cluster(&self) -> anyhow::Result<Outcome> {
        self.cluster_command(&[
            "start",
            "--coordinator-data-dir",
            self.config().coordinator.target_data_dir.as_str(),
        ])
        .await?;
        Ok(Outcome::Complete)
    }
}
