// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Substep statuses and the live status event surface.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The status of one (step, substep) pair.
///
/// Statuses are persisted by name, not by number, so the on-disk file
/// stays legible during incident response.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Never attempted. Absent store entries read back as `Unknown`.
    Unknown,
    /// The substep body was invoked and has not reported an outcome.
    /// Finding this on reentry means a crash interrupted the substep.
    Running,
    Complete,
    Failed,
    /// Reported to observers only. A skip is a deliberate, permanent
    /// outcome, so it is persisted as [`Status::Complete`].
    Skipped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Unknown => "unknown",
            Status::Running => "running",
            Status::Complete => "complete",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
        };
        write!(f, "{name}")
    }
}

/// One status transition, streamed to whoever is watching the run.
///
/// Delivery is best-effort: the observer may have disconnected, and a
/// failed send never affects the substep itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub substep: String,
    pub status: Status,
}

impl StatusEvent {
    pub fn new(substep: &str, status: Status) -> Self {
        Self { substep: substep.to_owned(), status }
    }
}
