//! History entries: completed reconciliation outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::event::EventSource;
use super::index_entry::ItemType;
use super::newtypes::RemotePath;

/// What a completed reconciliation did to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Added,
    Changed,
    Removed,
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryAction::Added => write!(f, "added"),
            HistoryAction::Changed => write!(f, "changed"),
            HistoryAction::Removed => write!(f, "removed"),
        }
    }
}

impl std::str::FromStr for HistoryAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(HistoryAction::Added),
            "changed" => Ok(HistoryAction::Changed),
            "removed" => Ok(HistoryAction::Removed),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown history action: {other}"
            ))),
        }
    }
}

/// One completed outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub path: RemotePath,
    pub action: HistoryAction,
    pub item_type: ItemType,
    /// Replica where the change originated
    pub origin: EventSource,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        path: RemotePath,
        action: HistoryAction,
        item_type: ItemType,
        origin: EventSource,
    ) -> Self {
        Self {
            path,
            action,
            item_type,
            origin,
            timestamp: Utc::now(),
        }
    }
}
