/*
 * 5D Labs Agent Platform - ML Model Watcher
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::doc_markdown)]

//! Model watcher core library
//!
//! Watches a dataset `ConfigMap`, submits a one-shot regeneration Job for
//! every new configuration, and rolls the serving Deployment once that Job
//! succeeds.

pub mod config;
pub mod dataset;
pub mod error;
pub mod fingerprint;
pub mod job;
pub mod lease;
pub mod naming;
pub mod platform;
pub mod reconciler;
pub mod restart;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod watcher;

// Re-export commonly used types
pub use config::WatcherConfig;
pub use dataset::{DatasetParams, Hyperparameters, WatchedConfig};
pub use error::{Error, Result, SubmissionError};
pub use fingerprint::Fingerprint;
pub use job::TaskSpec;
pub use naming::JobNamer;
pub use platform::{KubePlatform, Platform, TaskState};
pub use reconciler::{ReconcileAction, Reconciler, TickReport};
pub use state::{OutcomeKind, SharedState, StateStore, WatcherState};
pub use watcher::Observation;
