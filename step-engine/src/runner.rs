// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequencing of substeps within one step, with resumption bookkeeping.

use slog::{Logger, debug, error, info, o};
use std::collections::BTreeSet;
use std::future::Future;
use tokio::sync::mpsc;

use upgrade_common::errors;

use crate::events::{Status, StatusEvent};
use crate::store::{StoreError, SubstepStore};

/// The outcome a substep body reports when it does not fail.
///
/// `Skipped` is a deliberate request to be marked done without having done
/// anything (e.g. "upgrade standby" on a cluster with no standby). It is
/// persisted as complete and never retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Skipped,
}

/// Returned when the operator declines to proceed before a step begins.
///
/// This is an abort, not a failure: nothing has been persisted, and the
/// run can simply be started again.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("canceled by user")]
pub struct UserCanceled;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// A substep was found `running` on reentry: a previous process
    /// crashed while it was in flight, and whether its side effects
    /// happened is unknowable. Never auto-resumed.
    #[error(
        "substep \"{substep}\" of step \"{step}\" was interrupted mid-run; \
         the cluster may be in an inconsistent state and requires manual \
         intervention before retrying"
    )]
    Interrupted { step: String, substep: String },

    #[error("substep \"{substep}\" failed")]
    Failed {
        substep: String,
        #[source]
        source: anyhow::Error,
    },

    /// The engine could not record a status transition. Without reliable
    /// bookkeeping no further substep may run.
    #[error("substep \"{substep}\": failed to persist status")]
    Bookkeeping {
        substep: String,
        #[source]
        source: StoreError,
    },
}

impl StepError {
    /// Remediation text for the operator, if any underlying cause carries
    /// it. Hints from an aggregated multi-host error are concatenated in
    /// order, one per line.
    pub fn next_actions(&self) -> Option<String> {
        match self {
            StepError::Failed { source, .. } => {
                let hints = errors::next_actions(source);
                if hints.is_empty() { None } else { Some(hints.join("\n")) }
            }
            _ => None,
        }
    }
}

enum RunMode {
    /// Skip if already complete.
    Normal,
    /// Run even if already complete.
    Always,
}

/// Runs the substeps of one named step, strictly in the order called.
///
/// Obtained from [`StepRunner::begin`]. Substep bodies are async closures
/// returning `Result<Outcome, anyhow::Error>`; the runner persists a
/// status transition around each invocation and streams it to the
/// observer. The first failure is recorded on the runner and
/// short-circuits every later `run` call; [`StepRunner::finish`] surfaces
/// it.
pub struct StepRunner {
    log: Logger,
    step: String,
    store: SubstepStore,
    sender: mpsc::Sender<StatusEvent>,
    only: Option<BTreeSet<String>>,
    failure: Option<StepError>,
}

impl StepRunner {
    /// Binds a runner to one step name, a substep store, and a status
    /// observer. Fails only if the store cannot be opened (or created on
    /// first use).
    pub async fn begin(
        log: &Logger,
        step: &str,
        store: SubstepStore,
        sender: mpsc::Sender<StatusEvent>,
    ) -> Result<StepRunner, StoreError> {
        store.ensure().await?;
        Ok(StepRunner {
            log: log.new(o!(
                "component" => "StepRunner",
                "step" => step.to_owned(),
            )),
            step: step.to_owned(),
            store,
            sender,
            only: None,
            failure: None,
        })
    }

    /// Restricts all subsequent `run` calls to the given substeps.
    ///
    /// Substeps outside the set are not executed and their stored status
    /// is left untouched, whatever it was. Used for partial resumption,
    /// e.g. a revert that only needs its first two substeps because
    /// execute never got past early initialization.
    pub fn only_run<I, S>(&mut self, substeps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = Some(substeps.into_iter().map(Into::into).collect());
    }

    /// Runs `body` unless this substep already completed in a prior
    /// invocation, in which case it is reported as skipped.
    pub async fn run<F, Fut>(&mut self, substep: &str, body: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Outcome, anyhow::Error>>,
    {
        self.run_impl(substep, RunMode::Normal, body).await
    }

    /// Runs `body` even if this substep already completed. For substeps
    /// whose work must be redone on every invocation (e.g. stopping a
    /// cluster that the operator may have restarted in between).
    pub async fn always_run<F, Fut>(&mut self, substep: &str, body: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Outcome, anyhow::Error>>,
    {
        self.run_impl(substep, RunMode::Always, body).await
    }

    /// Like [`StepRunner::run`], but a pure no-op when `should_run` is
    /// false: no status is read, written, or reported.
    pub async fn run_conditionally<F, Fut>(
        &mut self,
        substep: &str,
        should_run: bool,
        body: F,
    ) where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Outcome, anyhow::Error>>,
    {
        if !should_run {
            info!(self.log, "skipping substep"; "substep" => substep);
            return;
        }
        self.run_impl(substep, RunMode::Normal, body).await
    }

    /// The first failure recorded in this invocation, if any.
    pub fn err(&self) -> Option<&StepError> {
        self.failure.as_ref()
    }

    /// Consumes the runner and surfaces the first recorded failure.
    /// Always safe to call, including after failures.
    pub fn finish(self) -> Result<(), StepError> {
        match self.failure {
            None => Ok(()),
            Some(failure) => Err(failure),
        }
    }

    async fn run_impl<F, Fut>(&mut self, substep: &str, mode: RunMode, body: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Outcome, anyhow::Error>>,
    {
        // An earlier failure halts the rest of the step.
        if self.failure.is_some() {
            debug!(
                self.log,
                "skipping substep after earlier failure";
                "substep" => substep,
            );
            return;
        }

        if let Some(only) = &self.only {
            if !only.contains(substep) {
                info!(
                    self.log,
                    "substep not in restricted set, skipping";
                    "substep" => substep,
                );
                return;
            }
        }

        let status = match self.store.read(&self.step, substep).await {
            Ok(status) => status,
            Err(err) => {
                self.failure = Some(StepError::Bookkeeping {
                    substep: substep.to_owned(),
                    source: err,
                });
                return;
            }
        };

        match status {
            Status::Running => {
                // A previous orchestrator crashed while this substep was
                // in flight. Do not invoke the body.
                error!(
                    self.log,
                    "substep was left running by a previous crash";
                    "substep" => substep,
                );
                self.send(substep, Status::Failed);
                self.failure = Some(StepError::Interrupted {
                    step: self.step.clone(),
                    substep: substep.to_owned(),
                });
                return;
            }
            Status::Complete if matches!(mode, RunMode::Normal) => {
                // Already done in a prior invocation; the store already
                // says complete, so there is nothing to rewrite.
                info!(
                    self.log,
                    "substep already complete, skipping";
                    "substep" => substep,
                );
                self.send(substep, Status::Skipped);
                return;
            }
            _ => {}
        }

        if let Err(err) = self.persist(substep, Status::Running).await {
            self.failure = Some(err);
            return;
        }
        self.send(substep, Status::Running);
        info!(self.log, "starting substep"; "substep" => substep);

        let result = body().await;

        let (persisted, reported) = match &result {
            Ok(Outcome::Complete) => (Status::Complete, Status::Complete),
            Ok(Outcome::Skipped) => (Status::Skipped, Status::Skipped),
            Err(_) => (Status::Failed, Status::Failed),
        };
        if let Err(err) = self.persist(substep, persisted).await {
            self.failure = Some(err);
            return;
        }
        self.send(substep, reported);

        match result {
            Ok(outcome) => {
                info!(
                    self.log,
                    "substep finished";
                    "substep" => substep,
                    "outcome" => ?outcome,
                );
            }
            Err(source) => {
                error!(
                    self.log,
                    "substep failed";
                    "substep" => substep,
                    "error" => format!("{source:#}"),
                );
                self.failure = Some(StepError::Failed {
                    substep: substep.to_owned(),
                    source,
                });
            }
        }
    }

    async fn persist(
        &self,
        substep: &str,
        status: Status,
    ) -> Result<(), StepError> {
        self.store.write(&self.step, substep, status).await.map_err(|err| {
            StepError::Bookkeeping {
                substep: substep.to_owned(),
                source: err,
            }
        })
    }

    /// Best-effort status notification. The observer may have gone away;
    /// that must never fail the substep.
    fn send(&self, substep: &str, status: Status) {
        if let Err(err) = self.sender.try_send(StatusEvent::new(substep, status))
        {
            debug!(
                self.log,
                "failed to deliver status event";
                "substep" => substep,
                "error" => %err,
            );
        }
    }
}
