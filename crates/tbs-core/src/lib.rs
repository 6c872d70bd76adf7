//! Core domain model for The Bed Shop hierarchy sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tbs-core";

/// Management level an identity holds within the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerRole {
    RegionalManager,
    AreaManager,
    StoreManager,
}

impl ManagerRole {
    /// Stable string form used in persisted rows and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerRole::RegionalManager => "regional_manager",
            ManagerRole::AreaManager => "area_manager",
            ManagerRole::StoreManager => "store_manager",
        }
    }
}

impl std::fmt::Display for ManagerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical person extracted from the upload. The lower-cased email is the
/// authoritative identity; everything else is display data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerIdentity {
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
}

/// Tri-state occupancy of a manager column group on one row.
///
/// A blank cell means the upload simply did not say who holds the role; the
/// `vacant` sentinel means the business explicitly declared it unfilled. Both
/// link to no one, but the distinction is preserved rather than collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "identity", rename_all = "snake_case")]
pub enum RoleSlot {
    #[default]
    NotProvided,
    Vacant,
    Assigned(ManagerIdentity),
}

impl RoleSlot {
    pub fn assigned(&self) -> Option<&ManagerIdentity> {
        match self {
            RoleSlot::Assigned(identity) => Some(identity),
            _ => None,
        }
    }

    /// True for both `NotProvided` and `Vacant`.
    pub fn is_empty(&self) -> bool {
        self.assigned().is_none()
    }
}

/// A fully validated upload row, ready for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyRow {
    /// 1-based position in the worksheet, header included.
    pub row_number: usize,
    pub store_code: String,
    pub store_name: String,
    pub region: Option<String>,
    pub regional_manager: RoleSlot,
    pub area_manager: RoleSlot,
    pub store_manager: RoleSlot,
}

/// Deduplicated store candidate keyed by upper-cased code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub code: String,
    pub name: String,
    pub region: Option<String>,
}

/// Per-row validation failure. Non-fatal to the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row_number: usize,
    pub message: String,
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}: {}", self.row_number, self.message)
    }
}

/// The three persisted relation types between hierarchy entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    StoreManagerToStore,
    AreaManagerToStore,
    RegionalToAreaManager,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::StoreManagerToStore => "store_manager_store",
            RelationKind::AreaManagerToStore => "area_manager_store",
            RelationKind::RegionalToAreaManager => "regional_area_manager",
        }
    }
}

/// Classification of a collected (non-fatal) run error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    RowValidation,
    Conflict,
    Upsert,
    Link,
}

/// One entry in a run's error list, attached to the audit log verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub row_numbers: Vec<usize>,
    pub message: String,
}

impl RunError {
    pub fn row_validation(err: &RowError) -> Self {
        Self {
            kind: RunErrorKind::RowValidation,
            row_numbers: vec![err.row_number],
            message: err.message.clone(),
        }
    }
}

/// Created/updated/deactivated tallies for one entity family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntityCounts {
    pub created: u32,
    pub updated: u32,
    pub deactivated: u32,
}

/// Outcome of one upload run; also the shape of the audit log payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// SHA-256 of the uploaded workbook as archived.
    pub source_sha256: String,
    pub total_rows: usize,
    pub succeeded_rows: usize,
    pub failed_rows: usize,
    pub users: EntityCounts,
    pub stores: EntityCounts,
    pub assignments: EntityCounts,
    pub conflicts: usize,
    pub errors: Vec<RunError>,
}
