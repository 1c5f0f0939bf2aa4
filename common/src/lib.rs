// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the upgrade hub and per-host agents.
//!
//! This crate holds the pieces that must behave identically on every host
//! participating in an upgrade: the idempotent directory transition
//! protocol, and the error types used to aggregate per-host failures and
//! carry operator remediation text.

pub mod errors;
pub mod transition;

pub use errors::{AggregateError, NextActions};
pub use transition::RenamePair;
