//! Incremental CRM deal synchronization: change detection, idempotent apply,
//! resumable batch imports and invoice triggering.

pub mod batch;
pub mod changes;
pub mod crm;
pub mod detector;
pub mod hasher;
pub mod invoice;
pub mod lease;
pub mod manager;
pub mod mapping;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod testing;

pub use batch::{BatchEstimate, BatchOrchestrator, BatchRequest};
pub use changes::{ChangeRecord, ChangeType};
pub use detector::{ChangeDetector, DetectOptions, Detection};
pub use manager::{BatchResult, SyncManager};
pub use scheduler::{Scheduler, TickSummary};
pub use service::{ManualSyncRequest, SyncEngineDeps, SyncMode, SyncReport, SyncService, SyncStatus};
