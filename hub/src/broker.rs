// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fan-out of per-host operations across the agent pool.
//!
//! Given a batch of payloads per hostname, the broker invokes the
//! corresponding remote operation on every host concurrently, waits for
//! all of them (a join barrier, no task is abandoned), and aggregates
//! every failure with its host attribution. One slow or failing host
//! never short-circuits its siblings.
//!
//! No cross-host ordering is guaranteed or required: the operations
//! dispatched through here are idempotent and commutative by design.

use futures::future::BoxFuture;
use slog::{Logger, debug};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use upgrade_common::AggregateError;

use crate::agent::AgentApi;
use crate::pool::AgentPool;

/// Payloads grouped by hostname.
pub type HostBatches<T> = BTreeMap<String, Vec<T>>;

/// Dispatches `op` once per host with that host's batch.
///
/// Hosts with an empty batch are skipped entirely; no call is made. A
/// host with a batch but no pooled connection contributes an error entry
/// for that host. `Ok(())` is returned only if no host produced an error.
pub async fn fan_out<T, F>(
    log: &Logger,
    pool: &AgentPool,
    batches: HostBatches<T>,
    op: F,
) -> Result<(), AggregateError>
where
    T: Send + 'static,
    F: Fn(Arc<dyn AgentApi>, Vec<T>) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + 'static,
{
    let mut errors = AggregateError::new();
    let host_count = batches.len();

    // Sized to the number of hosts, so every task can deposit its result
    // without blocking even if collection lags.
    let (tx, mut rx) = mpsc::channel(host_count.max(1));
    let mut tasks = JoinSet::new();

    for (host, batch) in batches {
        if batch.is_empty() {
            debug!(log, "empty batch, skipping host"; "host" => &host);
            continue;
        }
        let Some(client) = pool.client(&host) else {
            errors.push(anyhow::anyhow!("host {host}: not connected"));
            continue;
        };
        let future = op(client, batch);
        let tx = tx.clone();
        tasks.spawn(async move {
            let result = future.await;
            // The channel has room for every host; the receiver lives
            // until all tasks are joined.
            let _ = tx.send((host, result)).await;
        });
    }
    drop(tx);

    // Join barrier: every spawned task finishes before we return.
    while let Some(joined) = tasks.join_next().await {
        joined.expect("fan-out task panicked");
    }
    while let Some((host, result)) = rx.recv().await {
        if let Err(err) = result {
            errors.push(err.context(format!("host {host}")));
        }
    }

    errors.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{CommandRunner, Dialer};
    use crate::fakes::{FakeDialer, FakeRunner};
    use futures::FutureExt;
    use slog::o;

    fn test_log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    async fn pool_with(
        dialer: &Arc<FakeDialer>,
        hosts: &[&str],
    ) -> AgentPool {
        let pool = AgentPool::new(
            &test_log(),
            Arc::clone(dialer) as Arc<dyn Dialer>,
            FakeRunner::new() as Arc<dyn CommandRunner>,
        );
        let hosts: Vec<String> =
            hosts.iter().map(|h| h.to_string()).collect();
        pool.connect(&hosts, 6416).await.unwrap();
        pool
    }

    fn batch(entries: &[(&str, &[u32])]) -> HostBatches<u32> {
        entries
            .iter()
            .map(|(host, items)| (host.to_string(), items.to_vec()))
            .collect()
    }

    #[tokio::test]
    async fn contacts_every_host_and_aggregates_one_failure() {
        let dialer = FakeDialer::new();
        let agents = [
            dialer.register("sdw1"),
            dialer.register("sdw2"),
            dialer.register("sdw3"),
        ];
        agents[1].fail_with("no space left on device");
        let pool = pool_with(&dialer, &["sdw1", "sdw2", "sdw3"]).await;

        let result = fan_out(
            &test_log(),
            &pool,
            batch(&[("sdw1", &[1]), ("sdw2", &[2]), ("sdw3", &[3])]),
            |client, _items| {
                async move { Ok(client.status().await?) }.boxed()
            },
        )
        .await;

        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 1, "exactly one wrapped error");
        assert!(errors.to_string().contains("host sdw2"));
        // All three hosts were contacted despite the failure.
        for agent in &agents {
            assert_eq!(agent.call_count("status"), 1);
        }
    }

    #[tokio::test]
    async fn empty_batches_skip_the_host() {
        let dialer = FakeDialer::new();
        let contacted = dialer.register("sdw1");
        let skipped = dialer.register("sdw2");
        let pool = pool_with(&dialer, &["sdw1", "sdw2"]).await;

        fan_out(
            &test_log(),
            &pool,
            batch(&[("sdw1", &[1, 2]), ("sdw2", &[])]),
            |client, _items| {
                async move { Ok(client.status().await?) }.boxed()
            },
        )
        .await
        .unwrap();

        assert_eq!(contacted.call_count("status"), 1);
        assert!(skipped.calls().is_empty(), "empty batch means no call");
    }

    #[tokio::test]
    async fn missing_connection_is_an_error_entry() {
        let dialer = FakeDialer::new();
        let connected = dialer.register("sdw1");
        let pool = pool_with(&dialer, &["sdw1"]).await;

        let result = fan_out(
            &test_log(),
            &pool,
            batch(&[("sdw1", &[1]), ("sdw9", &[1])]),
            |client, _items| {
                async move { Ok(client.status().await?) }.boxed()
            },
        )
        .await;

        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors.to_string().contains("host sdw9: not connected"));
        // The connected sibling still ran.
        assert_eq!(connected.call_count("status"), 1);
    }

    #[tokio::test]
    async fn batch_order_reaches_the_operation_intact() {
        let dialer = FakeDialer::new();
        dialer.register("sdw1");
        let pool = pool_with(&dialer, &["sdw1"]).await;
        let (tx, mut rx) = mpsc::channel(1);

        fan_out(
            &test_log(),
            &pool,
            batch(&[("sdw1", &[3, 1, 2])]),
            move |_client, items| {
                let tx = tx.clone();
                async move {
                    tx.send(items).await.unwrap();
                    Ok(())
                }
                .boxed()
            },
        )
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap(), vec![3, 1, 2]);
    }
}
