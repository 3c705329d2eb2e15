/*
 * 5D Labs Issue Sync Controller - Kubernetes Orchestrator for Issue-to-Git Sync
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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Sync controller core library
//!
//! This crate turns declarative `SyncRequest` resources into Kubernetes Jobs that
//! sync issue-tracker content into Git repositories, and drives each request
//! through its lifecycle (dependency gate, processing, retry, completion).

pub mod clock;
pub mod crds;
pub mod jobs;
pub mod sync;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use crds::{ApiServer, SyncRequest, SyncRequestSpec, SyncRequestStatus};
pub use jobs::{JobError, JobErrorKind, JobScheduler, TemplateCatalog};
pub use sync::{SyncJobOrchestrator, SyncPipeline};
pub use tasks::config::ControllerConfig;
