//! Work items: a unit of deferred work against the external API or the store.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// The closed set of operation tags a work item may carry.
///
/// Each tag has exactly one fetch handler; the registry is checked against
/// [`OperationKind::ALL`] at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Character,
    CharacterHistory,
    Corporation,
    AllianceHistory,
    Alliance,
    LoyaltyStore,
    MarketOrders,
    StructureOrders,
    MarketHistory,
    Killmail,
    War,
    MarketMaintenance,
}

impl OperationKind {
    pub const ALL: [OperationKind; 12] = [
        OperationKind::Character,
        OperationKind::CharacterHistory,
        OperationKind::Corporation,
        OperationKind::AllianceHistory,
        OperationKind::Alliance,
        OperationKind::LoyaltyStore,
        OperationKind::MarketOrders,
        OperationKind::StructureOrders,
        OperationKind::MarketHistory,
        OperationKind::Killmail,
        OperationKind::War,
        OperationKind::MarketMaintenance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Character => "character",
            OperationKind::CharacterHistory => "characterHistory",
            OperationKind::Corporation => "corporation",
            OperationKind::AllianceHistory => "allianceHistory",
            OperationKind::Alliance => "alliance",
            OperationKind::LoyaltyStore => "loyaltyStore",
            OperationKind::MarketOrders => "marketOrders",
            OperationKind::StructureOrders => "structureOrders",
            OperationKind::MarketHistory => "marketHistory",
            OperationKind::Killmail => "killmail",
            OperationKind::War => "war",
            OperationKind::MarketMaintenance => "marketMaintenance",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OperationKind::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| Error::UnknownOperation(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Dequeue tier. Higher tiers always drain before lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Tiers from highest to lowest, the order dequeue scans them in.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn as_i16(self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Urgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(Error::Other(format!("invalid priority: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Work as submitted by a producer. The queue assigns identity and tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub operation: OperationKind,
    /// Opaque to the queue; each operation defines its own shape.
    pub parameter: serde_json::Value,
}

impl Work {
    pub fn new(operation: OperationKind, parameter: impl Into<serde_json::Value>) -> Self {
        Self {
            operation,
            parameter: parameter.into(),
        }
    }
}

/// A queued work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkId,
    pub operation: OperationKind,
    pub parameter: serde_json::Value,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn from_work(work: Work, priority: Priority) -> Self {
        Self {
            id: WorkId::new(),
            operation: work.operation,
            parameter: work.parameter,
            priority,
            enqueued_at: Utc::now(),
        }
    }

    /// Convert the parameter into the shape the operation expects.
    pub fn param<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.parameter.clone()).map_err(|e| Error::InvalidParameter {
            operation: self.operation.to_string(),
            message: e.to_string(),
        })
    }

    /// Stable key identifying the target of this item, used for cool-downs.
    pub fn target_key(&self) -> String {
        self.parameter.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_tags_round_trip_through_str() {
        for op in OperationKind::ALL {
            assert_eq!(op.as_str().parse::<OperationKind>().unwrap(), op);
            assert_eq!(
                serde_json::to_value(op).unwrap(),
                json!(op.as_str()),
                "serde name differs for {op:?}"
            );
        }
        assert!("charSearch".parse::<OperationKind>().is_err());
    }

    #[test]
    fn priorities_order_by_tier() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::from_i16(Priority::High.as_i16()), Some(Priority::High));
        assert_eq!(Priority::from_i16(9), None);
    }

    #[test]
    fn param_mismatch_is_invalid_parameter() {
        let item = WorkItem::from_work(
            Work::new(OperationKind::Character, "not-a-number"),
            Priority::Normal,
        );
        let err = item.param::<i32>().unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }

    #[test]
    fn killmail_parameter_is_hash_then_id() {
        let item = WorkItem::from_work(
            Work::new(OperationKind::Killmail, json!(["abc123", 56271])),
            Priority::Low,
        );
        let (hash, id): (String, i32) = item.param().unwrap();
        assert_eq!(hash, "abc123");
        assert_eq!(id, 56271);

        let reversed = WorkItem::from_work(
            Work::new(OperationKind::Killmail, json!([56271, "abc123"])),
            Priority::Low,
        );
        assert!(reversed.param::<(String, i32)>().is_err());
    }
}
