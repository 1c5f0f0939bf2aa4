// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The remote operation surface of a per-host agent, and the injected
//! seams around dialing and process execution.
//!
//! The wire encoding of these calls is a collaborator's concern; the hub
//! only sees this trait. Production code dials real agents through a
//! [`Dialer`] implementation supplied at construction time, and tests
//! inject fakes; there are no reassignable globals anywhere.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;

use upgrade_common::RenamePair;

/// Errors surfaced by agent calls.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The connection was severed mid-call. During a stop-all this is the
    /// expected signature of an agent obeying a shutdown request; in any
    /// other context it is a real failure.
    #[error("agent connection severed")]
    Disconnected,

    #[error("agent unreachable: {0}")]
    Unreachable(String),

    /// The agent executed the request and reported a failure.
    #[error("agent error: {0}")]
    Remote(String),
}

/// A filesystem that failed a free-space check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiskShortfall {
    pub path: Utf8PathBuf,
    pub available_ratio: f64,
    pub required_ratio: f64,
}

/// A new port assignment for a data directory, applied by the agent after
/// directories have been moved into place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub data_dir: Utf8PathBuf,
    pub port: u16,
}

/// Operations the hub can ask a per-host agent to perform.
///
/// Batched operations apply their entries in the order given; the agent
/// never reorders a batch.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Readiness ping.
    async fn status(&self) -> Result<(), AgentError>;

    /// Applies a batch of directory renames, each idempotent under the
    /// directory transition protocol.
    async fn rename_directories(
        &self,
        pairs: &[RenamePair],
    ) -> Result<(), AgentError>;

    /// Removes directories that are not being promoted (mirrors,
    /// standbys). Missing directories are not errors.
    async fn delete_directories(
        &self,
        dirs: &[Utf8PathBuf],
    ) -> Result<(), AgentError>;

    /// Removes the agent's own state directory, once an upgrade has been
    /// finalized or reverted.
    async fn delete_state_directory(
        &self,
        dir: &Utf8Path,
    ) -> Result<(), AgentError>;

    /// Checks that each path's filesystem has at least `required_ratio`
    /// of its space free, returning the filesystems that fall short. An
    /// empty reply means every filesystem passed.
    async fn check_disk_space(
        &self,
        paths: &[Utf8PathBuf],
        required_ratio: f64,
    ) -> Result<Vec<DiskShortfall>, AgentError>;

    /// Rewrites port settings in the given data directories.
    async fn reconfigure_data_dirs(
        &self,
        assignments: &[PortAssignment],
    ) -> Result<(), AgentError>;

    /// Asks the agent process to terminate. A successful stop manifests
    /// as the agent severing the connection; an explicit reply means the
    /// agent failed to obey.
    async fn stop_agent(&self) -> Result<(), AgentError>;
}

/// Establishes connections to agents. Injected into the pool so tests
/// never dial anything real.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Arc<dyn AgentApi>, AgentError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start [{command}]")]
    Start {
        command: String,
        #[source]
        err: io::Error,
    },

    #[error("command [{command}] failed with {status}: {stderr}")]
    Failed { command: String, status: String, stderr: String },
}

/// Executes subprocesses (cluster start/stop/init tools, remote agent
/// launches over ssh). Injected so tests substitute a fake.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, returning its stdout on success.
    async fn run(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<String, CommandError>;
}

/// The production [`CommandRunner`], backed by [`tokio::process`].
#[derive(Clone, Copy, Debug, Default)]
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<String, CommandError> {
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|err| CommandError::Start {
                command: command.clone(),
                err,
            })?;
        if !output.status.success() {
            return Err(CommandError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
