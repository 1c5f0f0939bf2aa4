// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A step execution framework with on-disk progress tracking.
//!
//! An upgrade runs as a fixed sequence of named substeps within a named
//! step (initialize, execute, finalize, revert). Each substep's status is
//! persisted before and after its body runs, so an orchestrator that
//! crashed (or was deliberately stopped) days ago can be rerun and will
//! skip everything it already finished.
//!
//! The framework makes three promises:
//!
//! 1. At-most-one-attempt bookkeeping: a substep is marked `running`
//!    before its body is invoked. A substep found `running` on reentry
//!    means a crash interrupted it mid-flight; the engine refuses to rerun
//!    it and demands operator intervention.
//! 2. Safe reentry: substeps persisted as `complete` are skipped on
//!    rerun (unless explicitly forced), and a failure halts every
//!    subsequent substep in the same invocation.
//! 3. The status file stays inspectable: statuses are stored as
//!    human-readable names in a JSON object keyed by step and substep, so
//!    an operator can read (or, in an emergency, edit) it by hand.

mod events;
mod runner;
mod store;

pub use events::{Status, StatusEvent};
pub use runner::{Outcome, StepError, StepRunner, UserCanceled};
pub use store::{StoreError, SubstepStore};
