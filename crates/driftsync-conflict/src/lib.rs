//! DriftSync Conflict - Reconciliation decisions
//!
//! Provides:
//! - Change classification of both replicas against the index
//! - The action table mapping those classifications to a corrective action
//! - Conflict copy naming for keep-both resolution

pub mod detector;
pub mod namer;

pub use detector::{ChangeDetector, Decision, Observed, SideChange, SyncAction};
pub use namer::ConflictNamer;
