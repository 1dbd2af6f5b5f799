//! Reconciling the local form set with the server's form list
//!
//! This module handles:
//! - Planning which forms to add, update and delete under a sync policy
//! - Downloading definitions and media, and applying deletions
//! - Running sync cycles on a timer

mod scheduler;
mod synchronizer;

pub use scheduler::{SchedulerStop, SyncScheduler};
pub use synchronizer::{DownloadKind, DownloadOutcome, FormSynchronizer, SyncFailure, SyncReport};

use crate::forms::Form;
use crate::transport::FormSummary;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Which automatic changes a sync cycle may make
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No automatic sync; downloads happen only on request
    #[default]
    Manual,
    /// The local form set must equal the server's
    MatchExactly,
    /// Update forms already on the device; never add or remove
    PreviouslyDownloadedOnly,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Manual => "manual",
            SyncMode::MatchExactly => "match_exactly",
            SyncMode::PreviouslyDownloadedOnly => "previously_downloaded_only",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Changes a sync cycle should make
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub to_add: Vec<FormSummary>,
    pub to_update: Vec<FormSummary>,
    /// Live local rows whose identifier the server no longer lists
    pub to_delete: Vec<Form>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Diff the server's list against local forms.
///
/// Each server form is compared with the newest live local row sharing its
/// identifier: a differing content hash (or differing version when the
/// server gives no hash) means update, no local row means add. Under
/// `MatchExactly`, local identifiers missing from the server are deleted.
pub fn reconcile(mode: SyncMode, server: &[FormSummary], local: &[Form]) -> SyncPlan {
    let mut plan = SyncPlan::default();
    if mode == SyncMode::Manual {
        return plan;
    }

    let mut newest: HashMap<&str, &Form> = HashMap::new();
    for form in local.iter().filter(|f| !f.deleted) {
        newest
            .entry(form.form_identifier.as_str())
            .and_modify(|current| {
                if (form.date, form.id) > (current.date, current.id) {
                    *current = form;
                }
            })
            .or_insert(form);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for summary in server {
        if !seen.insert(summary.form_id.as_str()) {
            continue;
        }
        match newest.get(summary.form_id.as_str()) {
            None => {
                if mode == SyncMode::MatchExactly {
                    plan.to_add.push(summary.clone());
                }
            }
            Some(form) => {
                let changed = match summary.md5() {
                    Some(hash) => hash != form.md5_hash,
                    None => summary.version != form.version,
                };
                if changed {
                    plan.to_update.push(summary.clone());
                }
            }
        }
    }

    if mode == SyncMode::MatchExactly {
        plan.to_delete = local
            .iter()
            .filter(|f| !f.deleted && !seen.contains(f.form_identifier.as_str()))
            .cloned()
            .collect();
    }

    plan
}
