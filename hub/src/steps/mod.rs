// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The upgrade phases: fixed substep sequences per step.
//!
//! Each entry point binds a [`StepRunner`] to one step name and walks a
//! hard-coded sequence of substeps. The sequences are product
//! configuration, not engineering: the machinery that makes them
//! resumable lives in [`step_engine`], the fan-out in [`crate::broker`].
//!
//! Every entry point takes a `confirmed` flag: the operator's last chance
//! to abort. Declining cancels the whole step before anything is
//! persisted.

mod execute;
mod finalize;
mod initialize;
mod revert;

use slog::Logger;
use std::sync::Arc;
use tokio::sync::mpsc;

use step_engine::{
    StatusEvent, StepError, StepRunner, StoreError, UserCanceled,
};

use crate::agent::{CommandRunner, Dialer};
use crate::config::HubConfig;
use crate::pool::AgentPool;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Canceled(#[from] UserCanceled),

    #[error("failed to open substep store")]
    Store(#[from] StoreError),

    /// Finalize has begun publishing directories; past that point the
    /// source cluster can no longer be told apart from the target's
    /// remnants, so revert refuses to run.
    #[error(
        "finalize has already started; the upgrade can no longer be reverted"
    )]
    FinalizeStarted,

    #[error(transparent)]
    Step(#[from] StepError),
}

/// The orchestrator: one per state directory, driving a source cluster to
/// a target cluster through the four upgrade phases.
pub struct Hub {
    log: Logger,
    config: HubConfig,
    pool: AgentPool,
    runner: Arc<dyn CommandRunner>,
}

impl Hub {
    pub fn new(
        log: &Logger,
        config: HubConfig,
        dialer: Arc<dyn Dialer>,
        runner: Arc<dyn CommandRunner>,
    ) -> Hub {
        let pool = AgentPool::with_dial_timeout(
            log,
            dialer,
            Arc::clone(&runner),
            config.connect_timeout(),
        );
        Hub { log: log.clone(), config, pool, runner }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    /// Releases all agent connections.
    pub fn close(&self) {
        self.pool.close();
    }

    async fn begin(
        &self,
        step: &str,
        sender: mpsc::Sender<StatusEvent>,
    ) -> Result<StepRunner, HubError> {
        Ok(StepRunner::begin(
            &self.log,
            step,
            self.config.substep_store(),
            sender,
        )
        .await?)
    }

    fn confirm(confirmed: bool) -> Result<(), HubError> {
        if confirmed { Ok(()) } else { Err(UserCanceled.into()) }
    }

    /// Runs one of the opaque cluster utilities (start/stop/init).
    async fn cluster_command(&self, args: &[&str]) -> anyhow::Result<()> {
        self.runner.run("clusterctl", args).await?;
        Ok(())
    }
}
