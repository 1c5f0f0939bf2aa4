// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The initialize step: agents up, preflight checks, target cluster
//! created.

use anyhow::anyhow;
use futures::FutureExt;
use slog::info;
use tokio::sync::mpsc;

use step_engine::{Outcome, StatusEvent};
use upgrade_common::NextActions;

use crate::broker;
use crate::directories::batch_by_host;

use super::{Hub, HubError};

impl Hub {
    pub async fn initialize(
        &self,
        sender: mpsc::Sender<StatusEvent>,
        confirmed: bool,
    ) -> Result<(), HubError> {
        Self::confirm(confirmed)?;
        let mut runner = self.begin("initialize", sender).await?;

        // Connections do not survive an orchestrator restart, so agents
        // are (re)started on every invocation.
        runner.always_run("start_agents", || self.start_agents()).await;
        runner.run("check_disk_space", || self.check_disk_space()).await;
        runner
            .run("generate_target_config", || self.generate_target_config())
            .await;
        runner
            .run("init_target_cluster", || self.init_target_cluster())
            .await;

        Ok(runner.finish()?)
    }

    pub(super) async fn start_agents(&self) -> anyhow::Result<Outcome> {
        let hosts = self.config().segment_hosts();
        let report = self
            .pool()
            .restart_all(
                &hosts,
                self.config().agent_port,
                &self.config().state_dir,
            )
            .await;
        let restarted = report.into_result().map_err(anyhow::Error::new)?;
        if !restarted.is_empty() {
            info!(
                self.log,
                "restarted agents";
                "hosts" => restarted.join(", "),
            );
        }
        self.pool().connect(&hosts, self.config().agent_port).await?;
        Ok(Outcome::Complete)
    }

    /// Fans out a free-space check to every segment host. Shortfalls come
    /// back with remediation text so the operator knows which hosts to
    /// clear before rerunning.
    async fn check_disk_space(&self) -> anyhow::Result<Outcome> {
        let batches = batch_by_host(self.config().segments.iter().flat_map(
            |segment| {
                let mut paths =
                    vec![(segment.hostname.clone(), segment.source_data_dir.clone())];
                if let (Some(host), Some(dir)) =
                    (&segment.mirror_hostname, &segment.mirror_data_dir)
                {
                    paths.push((host.clone(), dir.clone()));
                }
                paths
            },
        ));

        let required = self.config().disk_free_ratio;
        broker::fan_out(&self.log, self.pool(), batches, move |client, paths| {
            async move {
                let shortfalls =
                    client.check_disk_space(&paths, required).await?;
                if shortfalls.is_empty() {
                    return Ok(());
                }
                let detail = shortfalls
                    .iter()
                    .map(|s| {
                        format!(
                            "{} has {:.0}% free, needs {:.0}%",
                            s.path,
                            s.available_ratio * 100.0,
                            s.required_ratio * 100.0
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(NextActions::new(
                    anyhow!("insufficient disk space: {detail}"),
                    "free disk space, or lower disk_free_ratio, \
                     then rerun initialize",
                )
                .into())
            }
            .boxed()
        })
        .await?;
        Ok(Outcome::Complete)
    }

    /// Writes the target cluster's layout into the state directory for
    /// the init utility to consume.
    async fn generate_target_config(&self) -> anyhow::Result<Outcome> {
        let path = self.target_config_path();
        let contents = serde_json::to_vec_pretty(&self.config().segments)?;
        tokio::fs::create_dir_all(&self.config().state_dir).await?;
        tokio::fs::write(&path, contents).await?;
        Ok(Outcome::Complete)
    }

    async fn init_target_cluster(&self) -> anyhow::Result<Outcome> {
        let config_path = self.target_config_path();
        self.cluster_command(&[
            "init",
            "--config",
            config_path.as_str(),
            "--coordinator-data-dir",
            self.config().coordinator.target_data_dir.as_str(),
        ])
        .await?;
        Ok(Outcome::Complete)
    }

    fn target_config_path(&self) -> camino::Utf8PathBuf {
        self.config().state_dir.join("target-cluster.json")
    }
}
