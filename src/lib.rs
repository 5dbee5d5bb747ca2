//! # EMR Runner
//!
//! Deploys a CloudFormation resource stack and runs Spark steps on EMR
//! clusters, driven by a templated YAML config.
//!
//! ## Flow
//!
//! ```text
//! config + settings ──► ConfigResolver (phase 1)
//!                           │
//!                           ▼
//!                     StackDeployer ──► resource stack (changesets)
//!                           │
//!                           ▼
//!                     ConfigResolver (phase 2, Resources + AWSAccountId)
//!                           │
//!                           ▼
//!                   ClusterController ──► EMR cluster / steps
//! ```
//!
//! [`HookDispatcher`] fires the configured actions at every phase boundary.
//! All waiting goes through [`poll::poll_until`], which honours a shared
//! cancellation token.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aws;
pub mod cluster;
pub mod config;
pub mod document;
pub mod error;
pub mod hooks;
pub mod poll;
pub mod runner;
pub mod services;
pub mod stack;
pub mod step;
pub mod template;

#[cfg(test)]
mod fakes;

// Error handling
pub use error::{Result, RunnerError};

// Configuration
pub use config::{ConfigResolver, ResolutionPhase, ResourceContext};
pub use document::{ClusterSpec, ConfigDocument, DeployConfig, KeyValue};

// Orchestration
pub use runner::EmrRunner;

// Stack deployment
pub use stack::{DeployOutcome, StackApi, StackDeployer};

// Cluster lifecycle
pub use cluster::{ClusterApi, ClusterController, ClusterState, StepState};

// Hooks
pub use hooks::{Hook, HookContext, HookDispatcher, LifecycleEvent};

// Steps
pub use step::{ExecutionStep, StepConfig};

// Polling
pub use poll::{PollPolicy, PollSettings};

// Service seams
pub use services::{AccountApi, ObjectStore, Services};
