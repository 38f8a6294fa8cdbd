//! External collaborators consumed by the ledger: a calendar and a text
//! analysis provider. Both are opaque; the core only relies on the traits.
pub mod local_calendar;
pub mod memory;

pub use local_calendar::LocalCalendar;
pub use memory::{InMemoryCalendar, StaticAnalyzer};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Named string fields returned by a text analysis provider.
pub type FieldMap = BTreeMap<String, String>;

/// Provider failures, propagated untouched by the core.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider timed out after {0} seconds")]
    Timeout(u64),

    #[error("provider rejected the request: {0}")]
    Rejected(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Transient failures a caller may retry. The core itself never does.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_) | ProviderError::Timeout(_))
    }
}

/// Structured input for a text analysis call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub attributes: BTreeMap<String, String>,
    pub message: String,
}

/// A new event to place on the calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub summary: String,
    pub notes: String,
}

#[async_trait]
pub trait TextAnalysisProvider: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<FieldMap, ProviderError>;
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// True when nothing on the calendar overlaps `[start, end)`.
    async fn is_slot_free(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, ProviderError>;

    /// Create the event and return the provider-assigned id.
    async fn create_event(&self, event: &EventRequest) -> Result<String, ProviderError>;
}

/// Half-open interval overlap: back-to-back windows never collide.
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}
