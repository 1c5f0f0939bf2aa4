// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster-wide directory transitions, batched per host.
//!
//! The hub performs the coordinator's own directory moves locally (see
//! [`upgrade_common::transition`]) and ships everything else to agents as
//! per-host batches through the broker. Hosts with nothing to do are
//! never contacted.

use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use slog::Logger;

use upgrade_common::{AggregateError, RenamePair};

use crate::broker::{self, HostBatches};
use crate::pool::AgentPool;

/// The suffix appended to a data directory when it is archived out of the
/// way (e.g. `/data/seg1` becomes `/data/seg1.old`).
pub const ARCHIVE_SUFFIX: &str = "old";

pub fn archive_path(data_dir: &Utf8Path) -> Utf8PathBuf {
    match data_dir.extension() {
        Some(ext) => data_dir.with_extension(format!("{ext}.{ARCHIVE_SUFFIX}")),
        None => data_dir.with_extension(ARCHIVE_SUFFIX),
    }
}

/// Groups (hostname, pair) entries into per-host batches, preserving the
/// order pairs were supplied within each host.
pub fn batch_by_host<T>(
    entries: impl IntoIterator<Item = (String, T)>,
) -> HostBatches<T> {
    let mut batches = HostBatches::new();
    for (host, entry) in entries {
        batches.entry(host).or_insert_with(Vec::new).push(entry);
    }
    batches
}

/// Applies a batch of renames on each host via its agent.
pub async fn rename_directories(
    log: &Logger,
    pool: &AgentPool,
    batches: HostBatches<RenamePair>,
) -> Result<(), AggregateError> {
    broker::fan_out(log, pool, batches, |client, pairs| {
        async move { Ok(client.rename_directories(&pairs).await?) }.boxed()
    })
    .await
}

/// Deletes un-promoted directories (mirrors, standbys) on each host.
pub async fn delete_directories(
    log: &Logger,
    pool: &AgentPool,
    batches: HostBatches<Utf8PathBuf>,
) -> Result<(), AggregateError> {
    broker::fan_out(log, pool, batches, |client, dirs| {
        async move { Ok(client.delete_directories(&dirs).await?) }.boxed()
    })
    .await
}

/// Deletes the agent state directory on every given host.
pub async fn delete_state_directories(
    log: &Logger,
    pool: &AgentPool,
    hosts: &[String],
    state_dir: &Utf8Path,
) -> Result<(), AggregateError> {
    let batches = hosts
        .iter()
        .map(|host| (host.clone(), vec![state_dir.to_owned()]))
        .collect();
    broker::fan_out(log, pool, batches, |client, dirs| {
        async move {
            for dir in &dirs {
                client.delete_state_directory(dir).await?;
            }
            Ok(())
        }
        .boxed()
    })
    .await
}
