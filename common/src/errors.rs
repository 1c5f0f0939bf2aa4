// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error aggregation and operator remediation.
//!
//! Multi-host operations must not short-circuit: every host is attempted,
//! and every failure is preserved with the host it came from. The broker
//! collects those failures into an [`AggregateError`]. A failure that has a
//! known recovery command wraps itself in [`NextActions`] so the operator is
//! told what to run next.

use std::fmt;

/// A collection of errors from independent attempts, none of which was
/// allowed to short-circuit the others.
///
/// `Display` renders every underlying error chain, one per line, so no
/// per-host attribution is lost when this is logged or shown to an
/// operator.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<anyhow::Error>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: anyhow::Error) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &anyhow::Error> {
        self.errors.iter()
    }

    /// Returns `Ok(())` if no errors were collected, and `self` otherwise.
    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.errors.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for error in &self.errors {
            // `{:#}` renders the full anyhow context chain inline.
            write!(f, "\n* {:#}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// An error carrying remediation text for the operator.
///
/// The message tells the operator what to do next (e.g. "check free space
/// on sdw3 and rerun initialize"). Remediation text survives aggregation:
/// [`next_actions`] walks an error chain, descending into any
/// [`AggregateError`] it finds, and returns every hint in order.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct NextActions {
    #[source]
    source: anyhow::Error,
    next_action: String,
}

impl NextActions {
    pub fn new(source: anyhow::Error, next_action: impl Into<String>) -> Self {
        Self { source, next_action: next_action.into() }
    }

    pub fn next_action(&self) -> &str {
        &self.next_action
    }
}

/// Collects remediation hints from `error` and everything beneath it.
///
/// Hints are returned in the order they are encountered: the chain is
/// walked outermost-first, and aggregated errors are visited in the order
/// their entries were pushed.
pub fn next_actions(error: &anyhow::Error) -> Vec<String> {
    let mut hints = Vec::new();
    push_next_actions(error, &mut hints);
    hints
}

fn push_next_actions(error: &anyhow::Error, hints: &mut Vec<String>) {
    for cause in error.chain() {
        if let Some(next) = cause.downcast_ref::<NextActions>() {
            hints.push(next.next_action.clone());
        } else if let Some(aggregate) = cause.downcast_ref::<AggregateError>() {
            for inner in aggregate.iter() {
                push_next_actions(inner, hints);
            }
        }
    }
}
