// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The upgrade hub: the coordinator-side orchestrator of an online
//! cluster upgrade.
//!
//! The hub owns one RPC connection to the agent process on every segment
//! host, fans remote operations out to them concurrently, and drives the
//! fixed substep sequences of each upgrade phase (initialize, execute,
//! finalize, revert) through the [`step_engine`] framework, so a crashed
//! or interrupted upgrade can be resumed, finalized, or reverted later.
//!
//! Process execution and agent dialing are injected as traits
//! ([`agent::CommandRunner`], [`agent::Dialer`]) so tests substitute
//! fakes without any shared mutable state; see [`fakes`].

pub mod agent;
pub mod broker;
pub mod config;
pub mod directories;
pub mod fakes;
pub mod pool;
pub mod steps;

pub use agent::{AgentApi, AgentError, CommandRunner, Dialer};
pub use config::HubConfig;
pub use pool::AgentPool;
pub use steps::{Hub, HubError};
