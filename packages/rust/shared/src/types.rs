//! Core domain types for enrichkit batches.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EnrichError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable identifier of a record within a batch (e.g. a subscriber id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// LookupKind
// ---------------------------------------------------------------------------

/// The kinds of lookup the pipeline can drive. Each maps to one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookupKind {
    /// Find a LinkedIn profile URL for a contact.
    LinkedinSearch,
    /// Scrape a discovered profile page (secondary stage).
    ProfilePage,
    /// Classify an email address as work/personal.
    EmailClass,
    /// Resolve a subscriber's city/state.
    Location,
}

impl LookupKind {
    pub const ALL: [LookupKind; 4] = [
        Self::LinkedinSearch,
        Self::ProfilePage,
        Self::EmailClass,
        Self::Location,
    ];

    /// Storage and config key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinkedinSearch => "linkedin-search",
            Self::ProfilePage => "profile-page",
            Self::EmailClass => "email-class",
            Self::Location => "location",
        }
    }
}

impl std::fmt::Display for LookupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LookupKind {
    type Err = EnrichError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| EnrichError::validation(format!("unknown lookup kind '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// RecordInput / Payload
// ---------------------------------------------------------------------------

/// Attributes of a contact record that lookups read from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    /// Target URL for page lookups (secondary stage).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Anything else the source system carried along.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RecordInput {
    /// Best available display name: full name, then first + last, then first.
    pub fn display_name(&self) -> Option<String> {
        let trimmed = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        if let Some(full) = trimmed(&self.full_name) {
            return Some(full);
        }
        match (trimmed(&self.first_name), trimmed(&self.last_name)) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(first), None) => Some(first),
            _ => None,
        }
    }
}

/// Normalized result of a successful lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Source-specific result fields.
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Secondary-stage URL found by this lookup, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_url: Option<String>,
}

// ---------------------------------------------------------------------------
// RecordStatus
// ---------------------------------------------------------------------------

/// Pipeline status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    InProgress,
    Succeeded,
    /// Failed attempt, retry budget not yet decided or remaining.
    Failed,
    FailedPermanently,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::FailedPermanently => "failed_permanently",
        }
    }

    /// No automatic transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedPermanently)
    }

    /// State machine edges. Re-applying the current status is always allowed;
    /// for terminal statuses that is a no-op in the store.
    ///
    /// `InProgress -> Pending` is the recovery edge for attempts that were
    /// interrupted (crash, cancelled before start).
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, FailedPermanently)
                | (InProgress, Succeeded)
                | (InProgress, Failed)
                | (InProgress, FailedPermanently)
                | (InProgress, Pending)
                | (Failed, Pending)
                | (Failed, FailedPermanently)
        )
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = EnrichError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "failed_permanently" => Ok(Self::FailedPermanently),
            other => Err(EnrichError::validation(format!("unknown status '{other}'"))),
        }
    }
}

/// Why a record ended in `FailedPermanently`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The lookup reported a permanent error.
    Permanent,
    /// Every attempt failed transiently and the retry budget ran out.
    Exhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "permanent" => Some(Self::Permanent),
            "exhausted" => Some(Self::Exhausted),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// StateRecord
// ---------------------------------------------------------------------------

/// Persisted pipeline progress for one record of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub batch_id: String,
    pub record_id: RecordId,
    pub kind: LookupKind,
    pub input: RecordInput,
    pub status: RecordStatus,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// Monotonic version used for optimistic concurrency. 0 = never saved.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// A fresh `Pending` record, not yet persisted.
    pub fn new_pending(
        batch_id: impl Into<String>,
        record_id: impl Into<RecordId>,
        kind: LookupKind,
        input: RecordInput,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            record_id: record_id.into(),
            kind,
            input,
            status: RecordStatus::Pending,
            attempt_count: 0,
            last_error: None,
            failure: None,
            payload: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Copy with a new status, keeping the version the store will check.
    pub fn with_status(&self, status: RecordStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// StackItem
// ---------------------------------------------------------------------------

/// A discovered secondary-stage URL waiting on a work stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackItem {
    /// Normalized URL (the dedup key).
    pub url: String,
    /// Record the URL was discovered for.
    pub record_id: RecordId,
    /// Batch the originating record belongs to.
    pub batch_id: String,
    /// Contact email carried along for the consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub pushed_at: DateTime<Utc>,
    /// Set once the item has been drained.
    #[serde(default)]
    pub consumed: bool,
}

// ---------------------------------------------------------------------------
// BatchCounts
// ---------------------------------------------------------------------------

/// Progress counts for a batch, as exposed to reporters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub pending: u64,
    pub in_progress: u64,
    /// Failed at least once, retry scheduled.
    pub failed_retrying: u64,
    pub succeeded: u64,
    /// Terminal because of a permanent lookup error.
    pub failed_permanently: u64,
    /// Terminal because the retry budget ran out.
    pub failed_exhausted: u64,
}

impl BatchCounts {
    pub fn total(&self) -> u64 {
        self.pending
            + self.in_progress
            + self.failed_retrying
            + self.succeeded
            + self.failed_permanently
            + self.failed_exhausted
    }

    /// Records that reached a terminal status.
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed_permanently + self.failed_exhausted
    }

    /// All `FailedPermanently` records regardless of reason.
    pub fn failed_terminal(&self) -> u64 {
        self.failed_permanently + self.failed_exhausted
    }
}
