//! Filled survey responses and their submission state machine

mod registry;
mod saver;

pub use registry::{InstanceIter, InstanceList, InstanceRegistry};
pub use saver::{Encryptor, FinalizeValidator, InstanceSaver, SaveRequest, WellFormedPayload};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Internal row id of an instance
pub type InstanceId = i64;

/// Task-level status recorded when unsubmitted work is deleted
pub const TASK_STATUS_CLOSED: &str = "closed";

/// Submission state of an instance.
///
/// ```text
/// INCOMPLETE -> COMPLETE -> SUBMITTED
///                  ^  |
///                  |  v
///           SUBMISSION_FAILED -> SUBMITTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Incomplete,
    Complete,
    Submitted,
    SubmissionFailed,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 4] = [
        InstanceStatus::Incomplete,
        InstanceStatus::Complete,
        InstanceStatus::Submitted,
        InstanceStatus::SubmissionFailed,
    ];

    /// Value stored in the registry
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Incomplete => "incomplete",
            InstanceStatus::Complete => "complete",
            InstanceStatus::Submitted => "submitted",
            InstanceStatus::SubmissionFailed => "submissionFailed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Whether the state machine has an edge from `self` to `next`
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Incomplete, Incomplete)
                | (Incomplete, Complete)
                | (Complete, Incomplete)
                | (Complete, Complete)
                | (Complete, Submitted)
                | (Complete, SubmissionFailed)
                | (SubmissionFailed, Incomplete)
                | (SubmissionFailed, Complete)
                | (SubmissionFailed, Submitted)
                | (SubmissionFailed, SubmissionFailed)
        )
    }

    /// Finalized and not yet accepted by the server
    pub fn is_sendable(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Complete | InstanceStatus::SubmissionFailed
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InstanceStatus::Incomplete => "INCOMPLETE",
            InstanceStatus::Complete => "COMPLETE",
            InstanceStatus::Submitted => "SUBMITTED",
            InstanceStatus::SubmissionFailed => "SUBMISSION_FAILED",
        };
        write!(f, "{}", label)
    }
}

/// One filled (or in-progress) survey response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub display_name: String,
    pub status: InstanceStatus,
    /// Epoch millis
    pub last_status_change_date: i64,
    /// The instance XML; attachments live next to it
    pub instance_file_path: PathBuf,
    pub form_identifier: String,
    pub form_version: Option<String>,
    /// Set when soft-deleted
    pub deleted_date: Option<i64>,
    pub geometry_type: Option<String>,
    pub geometry: Option<String>,
    pub task_status: Option<String>,
}

impl Instance {
    pub fn is_deleted(&self) -> bool {
        self.deleted_date.is_some()
    }

    /// Directory holding the XML and its attachments
    pub fn instance_dir(&self) -> Option<&Path> {
        self.instance_file_path.parent()
    }
}

/// Initial values for [`InstanceRegistry::create`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewInstance {
    /// Defaults to the form's display name
    pub display_name: Option<String>,
    /// Defaults to a fresh directory under `instances/`
    pub instance_file_path: Option<PathBuf>,
    /// Only `INCOMPLETE` is accepted
    pub status: Option<InstanceStatus>,
    /// Defaults to now
    pub last_status_change_date: Option<i64>,
    pub geometry_type: Option<String>,
    pub geometry: Option<String>,
}

/// Non-status field changes for [`InstanceRegistry::update`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceUpdate {
    pub display_name: Option<String>,
    pub instance_file_path: Option<PathBuf>,
    pub geometry_type: Option<String>,
    pub geometry: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    NameAsc,
    NameDesc,
    DateAsc,
    #[default]
    DateDesc,
    Status,
}

impl SortOrder {
    pub(crate) fn order_by(&self) -> &'static str {
        match self {
            SortOrder::NameAsc => "display_name COLLATE NOCASE ASC, id ASC",
            SortOrder::NameDesc => "display_name COLLATE NOCASE DESC, id DESC",
            SortOrder::DateAsc => "last_status_change_date ASC, id ASC",
            SortOrder::DateDesc => "last_status_change_date DESC, id DESC",
            SortOrder::Status => "status ASC, last_status_change_date DESC, id DESC",
        }
    }
}

/// Selection of instance rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceQuery {
    pub form_identifier: Option<String>,
    /// Only consulted when `form_identifier` is set
    pub form_version: Option<String>,
    /// Empty means any status
    pub statuses: Vec<InstanceStatus>,
    pub include_deleted: bool,
    pub sort: SortOrder,
}

impl InstanceQuery {
    /// Live rows in the given order
    pub fn active(sort: SortOrder) -> Self {
        Self {
            sort,
            ..Default::default()
        }
    }

    pub fn for_form(form_identifier: &str) -> Self {
        Self {
            form_identifier: Some(form_identifier.to_string()),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[InstanceStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}
