// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fake implementations of the hub's injected seams.
//!
//! These implement [`crate::agent::AgentApi`], [`crate::agent::Dialer`],
//! and [`crate::agent::CommandRunner`] without touching the network or
//! spawning processes, and record every call so tests can assert on
//! exactly what the hub asked for.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use upgrade_common::RenamePair;

use crate::agent::{
    AgentApi, AgentError, CommandError, CommandRunner, Dialer, DiskShortfall,
    PortAssignment,
};

/// How a [`FakeAgent`] responds to `stop_agent`.
#[derive(Clone, Debug, Default)]
pub enum StopReply {
    /// Sever the connection, as a real agent does while shutting down.
    #[default]
    Disconnect,
    /// Reply successfully, i.e. fail to obey the shutdown request.
    Reply,
    Fail(String),
}

/// A scriptable in-memory agent.
#[derive(Debug, Default)]
pub struct FakeAgent {
    calls: Mutex<Vec<String>>,
    renames: Mutex<Vec<RenamePair>>,
    deleted: Mutex<Vec<Utf8PathBuf>>,
    reconfigured: Mutex<Vec<PortAssignment>>,
    fail_with: Mutex<Option<String>>,
    shortfalls: Mutex<Vec<DiskShortfall>>,
    stop_reply: Mutex<StopReply>,
}

impl FakeAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every subsequent operation fail with `AgentError::Remote`.
    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_owned());
    }

    pub fn set_stop_reply(&self, reply: StopReply) {
        *self.stop_reply.lock().unwrap() = reply;
    }

    pub fn set_shortfalls(&self, shortfalls: Vec<DiskShortfall>) {
        *self.shortfalls.lock().unwrap() = shortfalls;
    }

    /// Every operation invoked on this agent, in order, by name.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == op).count()
    }

    pub fn renames(&self) -> Vec<RenamePair> {
        self.renames.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<Utf8PathBuf> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn reconfigured(&self) -> Vec<PortAssignment> {
        self.reconfigured.lock().unwrap().clone()
    }

    fn record(&self, op: &str) -> Result<(), AgentError> {
        self.calls.lock().unwrap().push(op.to_owned());
        match self.fail_with.lock().unwrap().as_ref() {
            Some(message) => Err(AgentError::Remote(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn status(&self) -> Result<(), AgentError> {
        self.record("status")
    }

    async fn rename_directories(
        &self,
        pairs: &[RenamePair],
    ) -> Result<(), AgentError> {
        self.record("rename_directories")?;
        self.renames.lock().unwrap().extend_from_slice(pairs);
        Ok(())
    }

    async fn delete_directories(
        &self,
        dirs: &[Utf8PathBuf],
    ) -> Result<(), AgentError> {
        self.record("delete_directories")?;
        self.deleted.lock().unwrap().extend_from_slice(dirs);
        Ok(())
    }

    async fn delete_state_directory(
        &self,
        dir: &Utf8Path,
    ) -> Result<(), AgentError> {
        self.record("delete_state_directory")?;
        self.deleted.lock().unwrap().push(dir.to_owned());
        Ok(())
    }

    async fn check_disk_space(
        &self,
        _paths: &[Utf8PathBuf],
        _required_ratio: f64,
    ) -> Result<Vec<DiskShortfall>, AgentError> {
        self.record("check_disk_space")?;
        Ok(self.shortfalls.lock().unwrap().clone())
    }

    async fn reconfigure_data_dirs(
        &self,
        assignments: &[PortAssignment],
    ) -> Result<(), AgentError> {
        self.record("reconfigure_data_dirs")?;
        self.reconfigured.lock().unwrap().extend_from_slice(assignments);
        Ok(())
    }

    async fn stop_agent(&self) -> Result<(), AgentError> {
        self.calls.lock().unwrap().push("stop_agent".to_owned());
        match &*self.stop_reply.lock().unwrap() {
            StopReply::Disconnect => Err(AgentError::Disconnected),
            StopReply::Reply => Ok(()),
            StopReply::Fail(message) => {
                Err(AgentError::Remote(message.clone()))
            }
        }
    }
}

/// A dialer that hands out registered [`FakeAgent`]s.
#[derive(Debug, Default)]
pub struct FakeDialer {
    agents: Mutex<BTreeMap<String, Arc<FakeAgent>>>,
    unreachable: Mutex<BTreeSet<String>>,
    dialed: Mutex<Vec<String>>,
}

impl FakeDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an agent for `hostname` and returns it for later
    /// assertions.
    pub fn register(&self, hostname: &str) -> Arc<FakeAgent> {
        let agent = FakeAgent::new();
        self.agents
            .lock()
            .unwrap()
            .insert(hostname.to_owned(), Arc::clone(&agent));
        agent
    }

    /// Makes dialing `hostname` fail until [`Self::make_reachable`].
    pub fn make_unreachable(&self, hostname: &str) {
        self.unreachable.lock().unwrap().insert(hostname.to_owned());
    }

    pub fn make_reachable(&self, hostname: &str) {
        self.unreachable.lock().unwrap().remove(hostname);
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(
        &self,
        hostname: &str,
        _port: u16,
    ) -> Result<Arc<dyn AgentApi>, AgentError> {
        self.dialed.lock().unwrap().push(hostname.to_owned());
        if self.unreachable.lock().unwrap().contains(hostname) {
            return Err(AgentError::Unreachable(format!(
                "{hostname}: connection refused"
            )));
        }
        match self.agents.lock().unwrap().get(hostname) {
            Some(agent) => Ok(Arc::clone(agent) as Arc<dyn AgentApi>),
            None => Err(AgentError::Unreachable(format!(
                "{hostname}: no agent registered"
            ))),
        }
    }
}

/// A command runner that records command lines instead of executing them.
#[derive(Debug, Default)]
pub struct FakeRunner {
    commands: Mutex<Vec<String>>,
    fail_matching: Mutex<Option<String>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes any command whose line contains `needle` fail.
    pub fn fail_matching(&self, needle: &str) {
        *self.fail_matching.lock().unwrap() = Some(needle.to_owned());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<String, CommandError> {
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.commands.lock().unwrap().push(command.clone());
        if let Some(needle) = self.fail_matching.lock().unwrap().as_ref() {
            if command.contains(needle) {
                return Err(CommandError::Failed {
                    command,
                    status: "exit status: 1".to_owned(),
                    stderr: "injected failure".to_owned(),
                });
            }
        }
        Ok(String::new())
    }
}
