// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The agent connection pool.
//!
//! One live connection per participating host, keyed uniquely by
//! hostname, created on first need and reused for the life of the hub
//! process. The connection map is guarded by a single coarse lock;
//! connect, restart, and close are rare relative to steady-state RPCs,
//! so contention is not a concern.

use anyhow::anyhow;
use camino::Utf8Path;
use slog::{Logger, info, o, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use upgrade_common::AggregateError;

use crate::agent::{AgentApi, AgentError, CommandRunner, Dialer};

/// How long a dial may take before the host is declared unreachable.
/// Short, so a down host fails fast instead of hanging the whole step.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// A live connection to one host's agent. Owned exclusively by the pool.
struct Connection {
    client: Arc<dyn AgentApi>,
    cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// On a repeat connect, some existing connections failed their
    /// readiness check.
    #[error("agents not ready on hosts: {}", hosts.join(", "))]
    NotReady { hosts: Vec<String> },

    #[error("failed to connect to agents")]
    Connect(#[source] AggregateError),
}

/// The result of [`AgentPool::restart_all`]: which hosts had their agent
/// relaunched, plus every failure encountered along the way.
#[derive(Debug, Default)]
pub struct RestartReport {
    pub restarted: Vec<String>,
    pub failures: AggregateError,
}

impl RestartReport {
    pub fn into_result(self) -> Result<Vec<String>, AggregateError> {
        self.failures.into_result().map(|()| self.restarted)
    }
}

pub struct AgentPool {
    log: Logger,
    dialer: Arc<dyn Dialer>,
    runner: Arc<dyn CommandRunner>,
    dial_timeout: Duration,
    connections: Mutex<BTreeMap<String, Connection>>,
}

impl AgentPool {
    pub fn new(
        log: &Logger,
        dialer: Arc<dyn Dialer>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self::with_dial_timeout(log, dialer, runner, DEFAULT_DIAL_TIMEOUT)
    }

    pub fn with_dial_timeout(
        log: &Logger,
        dialer: Arc<dyn Dialer>,
        runner: Arc<dyn CommandRunner>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "AgentPool")),
            dialer,
            runner,
            dial_timeout,
            connections: Mutex::new(BTreeMap::new()),
        }
    }

    /// Establishes one connection per host not already connected.
    ///
    /// Hosts that already have a connection are verified with a readiness
    /// ping instead of being re-dialed; if any are not ready the call
    /// fails listing them. New dials run concurrently and their failures
    /// are aggregated.
    pub async fn connect(
        &self,
        hosts: &[String],
        port: u16,
    ) -> Result<(), PoolError> {
        let mut to_verify = Vec::new();
        let mut to_dial = Vec::new();
        {
            let connections = self.connections.lock().unwrap();
            for host in hosts {
                if let Some(conn) = connections.get(host) {
                    to_verify.push((host.clone(), Arc::clone(&conn.client)));
                } else {
                    to_dial.push(host.clone());
                }
            }
        }

        let mut not_ready = Vec::new();
        for (host, client) in to_verify {
            if let Err(err) = client.status().await {
                warn!(
                    self.log,
                    "existing agent connection is not ready";
                    "host" => &host,
                    "error" => %err,
                );
                not_ready.push(host);
            }
        }
        if !not_ready.is_empty() {
            return Err(PoolError::NotReady { hosts: not_ready });
        }

        let mut tasks = JoinSet::new();
        for host in to_dial {
            let dialer = Arc::clone(&self.dialer);
            let timeout = self.dial_timeout;
            tasks.spawn(async move {
                let result = dial_with_timeout(&*dialer, &host, port, timeout)
                    .await;
                (host, result)
            });
        }

        let mut errors = AggregateError::new();
        while let Some(joined) = tasks.join_next().await {
            let (host, result) = joined.expect("dial task panicked");
            match result {
                Ok(client) => {
                    info!(self.log, "connected to agent"; "host" => &host);
                    self.insert(host, client);
                }
                Err(err) => {
                    errors.push(
                        anyhow::Error::new(err)
                            .context(format!("host {host}")),
                    );
                }
            }
        }
        errors.into_result().map_err(PoolError::Connect)
    }

    /// Ensures an agent is running on every host, relaunching it where
    /// necessary.
    ///
    /// Each host is attempted concurrently: a bounded-timeout dial first,
    /// and on failure a remote launch of the agent process, recording the
    /// host as restarted. Failures are aggregated; no host aborts the
    /// others.
    pub async fn restart_all(
        &self,
        hosts: &[String],
        port: u16,
        state_dir: &Utf8Path,
    ) -> RestartReport {
        let mut tasks = JoinSet::new();
        for host in hosts {
            let host = host.clone();
            let dialer = Arc::clone(&self.dialer);
            let runner = Arc::clone(&self.runner);
            let timeout = self.dial_timeout;
            let state_dir = state_dir.to_owned();
            tasks.spawn(async move {
                match dial_with_timeout(&*dialer, &host, port, timeout).await {
                    Ok(client) => (host, Ok(Some(client))),
                    Err(_) => {
                        // No agent answered; launch one remotely.
                        let launch = format!(
                            "upgrade-agent --daemonize \
                             --port {port} --state-dir {state_dir}"
                        );
                        let result = runner
                            .run("ssh", &[&host, &launch])
                            .await
                            .map(|_| None)
                            .map_err(|err| {
                                anyhow::Error::new(err).context(format!(
                                    "failed to restart agent on host {host}"
                                ))
                            });
                        (host, result)
                    }
                }
            });
        }

        let mut report = RestartReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (host, result) = joined.expect("restart task panicked");
            match result {
                Ok(Some(client)) => self.insert(host, client),
                Ok(None) => {
                    info!(self.log, "restarted agent"; "host" => &host);
                    report.restarted.push(host);
                }
                Err(err) => report.failures.push(err),
            }
        }
        report.restarted.sort();
        report
    }

    /// Tells every connected agent to terminate.
    ///
    /// A successful stop is detected as the agent severing the connection
    /// while replying; an explicit reply means the agent failed to obey.
    /// Agents that stop are removed from the pool.
    pub async fn stop_all(&self) -> Result<(), AggregateError> {
        let clients: Vec<(String, Arc<dyn AgentApi>)> = {
            let connections = self.connections.lock().unwrap();
            connections
                .iter()
                .map(|(host, conn)| (host.clone(), Arc::clone(&conn.client)))
                .collect()
        };

        let mut tasks = JoinSet::new();
        for (host, client) in clients {
            tasks.spawn(async move {
                let result = match client.stop_agent().await {
                    // The expected signature of an agent self-terminating
                    // mid-reply.
                    Err(AgentError::Disconnected) => Ok(()),
                    Ok(()) => Err(anyhow!(
                        "agent on host {host} did not terminate"
                    )),
                    Err(err) => Err(anyhow::Error::new(err)
                        .context(format!("host {host}"))),
                };
                (host, result)
            });
        }

        let mut errors = AggregateError::new();
        while let Some(joined) = tasks.join_next().await {
            let (host, result) = joined.expect("stop task panicked");
            match result {
                Ok(()) => {
                    info!(self.log, "agent stopped"; "host" => &host);
                    self.remove(&host);
                }
                Err(err) => errors.push(err),
            }
        }
        errors.into_result()
    }

    /// Releases every connection and cancels their outstanding work. Safe
    /// to call at any time, including before anything connected.
    pub fn close(&self) {
        let mut connections = self.connections.lock().unwrap();
        for (host, conn) in connections.iter() {
            info!(self.log, "closing agent connection"; "host" => host);
            conn.cancel.cancel();
        }
        connections.clear();
    }

    /// The client for `hostname`, if connected.
    pub fn client(&self, hostname: &str) -> Option<Arc<dyn AgentApi>> {
        self.connections
            .lock()
            .unwrap()
            .get(hostname)
            .map(|conn| Arc::clone(&conn.client))
    }

    pub fn connected_hosts(&self) -> Vec<String> {
        self.connections.lock().unwrap().keys().cloned().collect()
    }

    fn insert(&self, hostname: String, client: Arc<dyn AgentApi>) {
        let mut connections = self.connections.lock().unwrap();
        // Keyed uniquely by hostname: a second insert replaces (and
        // cancels) any connection raced into place.
        if let Some(old) = connections.insert(
            hostname,
            Connection { client, cancel: CancellationToken::new() },
        ) {
            old.cancel.cancel();
        }
    }

    fn remove(&self, hostname: &str) {
        if let Some(conn) = self.connections.lock().unwrap().remove(hostname) {
            conn.cancel.cancel();
        }
    }
}

async fn dial_with_timeout(
    dialer: &dyn Dialer,
    hostname: &str,
    port: u16,
    timeout: Duration,
) -> Result<Arc<dyn AgentApi>, AgentError> {
    match tokio::time::timeout(timeout, dialer.dial(hostname, port)).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Unreachable(format!(
            "{hostname}: dial timed out after {timeout:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeDialer, FakeRunner, StopReply};
    use camino::Utf8PathBuf;

    fn test_log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn connect_establishes_one_connection_per_host() {
        let dialer = FakeDialer::new();
        dialer.register("sdw1");
        dialer.register("sdw2");
        let pool = AgentPool::new(
            &test_log(),
            Arc::clone(&dialer) as Arc<dyn Dialer>,
            FakeRunner::new(),
        );

        pool.connect(&hosts(&["sdw1", "sdw2"]), 6416).await.unwrap();
        assert_eq!(pool.connected_hosts(), hosts(&["sdw1", "sdw2"]));
        assert_eq!(dialer.dialed().len(), 2);
    }

    #[tokio::test]
    async fn repeat_connect_verifies_instead_of_redialing() {
        let dialer = FakeDialer::new();
        let agent = dialer.register("sdw1");
        let pool = AgentPool::new(
            &test_log(),
            Arc::clone(&dialer) as Arc<dyn Dialer>,
            FakeRunner::new(),
        );

        pool.connect(&hosts(&["sdw1"]), 6416).await.unwrap();
        pool.connect(&hosts(&["sdw1"]), 6416).await.unwrap();

        assert_eq!(dialer.dialed().len(), 1, "no second dial");
        assert_eq!(agent.call_count("status"), 1);
    }

    #[tokio::test]
    async fn repeat_connect_lists_not_ready_hosts() {
        let dialer = FakeDialer::new();
        let agent = dialer.register("sdw1");
        let pool = AgentPool::new(
            &test_log(),
            Arc::clone(&dialer) as Arc<dyn Dialer>,
            FakeRunner::new(),
        );
        pool.connect(&hosts(&["sdw1"]), 6416).await.unwrap();

        agent.fail_with("agent wedged");
        let err =
            pool.connect(&hosts(&["sdw1"]), 6416).await.unwrap_err();
        match err {
            PoolError::NotReady { hosts } => {
                assert_eq!(hosts, vec!["sdw1".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn connect_aggregates_dial_failures() {
        let dialer = FakeDialer::new();
        dialer.register("sdw1");
        dialer.make_unreachable("sdw2");
        dialer.make_unreachable("sdw3");
        let pool = AgentPool::new(
            &test_log(),
            Arc::clone(&dialer) as Arc<dyn Dialer>,
            FakeRunner::new(),
        );

        let err = pool
            .connect(&hosts(&["sdw1", "sdw2", "sdw3"]), 6416)
            .await
            .unwrap_err();
        match err {
            PoolError::Connect(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        // The reachable host still got its connection.
        assert!(pool.client("sdw1").is_some());
    }

    #[tokio::test]
    async fn restart_all_relaunches_unreachable_agents() {
        let dialer = FakeDialer::new();
        dialer.register("sdw1");
        dialer.make_unreachable("sdw2");
        let runner = FakeRunner::new();
        let pool = AgentPool::new(
            &test_log(),
            Arc::clone(&dialer) as Arc<dyn Dialer>,
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
        );

        let report = pool
            .restart_all(
                &hosts(&["sdw1", "sdw2"]),
                6416,
                &Utf8PathBuf::from("/var/lib/upgrade"),
            )
            .await;
        let restarted = report.into_result().unwrap();
        assert_eq!(restarted, vec!["sdw2".to_string()]);

        let commands = runner.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("ssh sdw2"));
        assert!(commands[0].contains("--state-dir /var/lib/upgrade"));
    }

    #[tokio::test]
    async fn restart_all_aggregates_launch_failures() {
        let dialer = FakeDialer::new();
        dialer.make_unreachable("sdw1");
        dialer.make_unreachable("sdw2");
        let runner = FakeRunner::new();
        runner.fail_matching("sdw1");
        let pool = AgentPool::new(
            &test_log(),
            Arc::clone(&dialer) as Arc<dyn Dialer>,
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
        );

        let report = pool
            .restart_all(
                &hosts(&["sdw1", "sdw2"]),
                6416,
                &Utf8PathBuf::from("/var/lib/upgrade"),
            )
            .await;
        assert_eq!(report.restarted, vec!["sdw2".to_string()]);
        assert_eq!(report.failures.len(), 1);
        // Both hosts were attempted despite the failure.
        assert_eq!(runner.commands().len(), 2);
    }

    #[tokio::test]
    async fn stop_all_expects_disconnection() {
        let dialer = FakeDialer::new();
        let obedient = dialer.register("sdw1");
        let defiant = dialer.register("sdw2");
        defiant.set_stop_reply(StopReply::Reply);
        let pool = AgentPool::new(
            &test_log(),
            Arc::clone(&dialer) as Arc<dyn Dialer>,
            FakeRunner::new(),
        );
        pool.connect(&hosts(&["sdw1", "sdw2"]), 6416).await.unwrap();

        let err = pool.stop_all().await.unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err.to_string().contains("sdw2 did not terminate"));
        assert_eq!(obedient.call_count("stop_agent"), 1);

        // The obedient agent was removed; the defiant one remains.
        assert_eq!(pool.connected_hosts(), hosts(&["sdw2"]));
    }

    #[tokio::test]
    async fn close_is_safe_before_and_after_connect() {
        let dialer = FakeDialer::new();
        dialer.register("sdw1");
        let pool = AgentPool::new(
            &test_log(),
            Arc::clone(&dialer) as Arc<dyn Dialer>,
            FakeRunner::new(),
        );
        pool.close();

        pool.connect(&hosts(&["sdw1"]), 6416).await.unwrap();
        pool.close();
        assert!(pool.connected_hosts().is_empty());
        pool.close();
    }
}
