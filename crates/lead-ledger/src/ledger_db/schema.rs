//! Record types and table layout for the lead ledger
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tables managed by the entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Lead,
    Qualification,
    Meeting,
    CalendarEvent,
    Interaction,
    Email,
}

impl EntityKind {
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Lead => "leads",
            EntityKind::Qualification => "lead_qualifications",
            EntityKind::Meeting => "meetings",
            EntityKind::CalendarEvent => "calendar_events",
            EntityKind::Interaction => "interactions",
            EntityKind::Email => "emails",
        }
    }

    /// Every readable column, in select order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Lead => &[
                "lead_id", "name", "company", "contact_address", "status", "created_at", "updated_at",
            ],
            EntityKind::Qualification => &[
                "id", "lead_id", "priority", "score", "reasoning", "next_action",
                "disposition", "disposition_confidence", "sentiment", "urgency",
                "last_reply_analysis", "recommended_follow_up", "follow_up_timing",
                "created_at", "updated_at",
            ],
            EntityKind::Meeting => &[
                "id", "lead_id", "status", "datetime", "meeting_type", "duration_minutes",
                "urgency", "preferred_time", "notes", "created_at", "updated_at",
            ],
            EntityKind::CalendarEvent => &[
                "id", "meeting_id", "event_id", "datetime", "duration_minutes", "status", "link",
                "created_at", "updated_at",
            ],
            EntityKind::Interaction => &["id", "lead_id", "event_type", "event_data", "timestamp"],
            EntityKind::Email => &[
                "id", "lead_id", "to_address", "from_address", "subject", "body", "email_type", "sent_at",
            ],
        }
    }

    /// Timestamp columns the store fills on insert when the caller leaves them out.
    pub fn insert_stamps(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Interaction => &["timestamp"],
            EntityKind::Email => &["sent_at"],
            _ => &["created_at", "updated_at"],
        }
    }

    /// Column restamped on every in-place update, if the table has one.
    pub fn update_stamp(&self) -> Option<&'static str> {
        match self {
            EntityKind::Interaction | EntityKind::Email => None,
            _ => Some("updated_at"),
        }
    }

    /// Column that defines "latest" for this kind.
    pub fn order_column(&self) -> &'static str {
        match self {
            EntityKind::Interaction => "timestamp",
            EntityKind::Email => "sent_at",
            _ => "updated_at",
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Render a timestamp the way it is persisted: RFC 3339, UTC, microseconds.
/// Fixed width keeps lexical and chronological order identical.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `start` plus `minutes`, or `None` when the result is out of range.
pub fn add_minutes(start: DateTime<Utc>, minutes: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_minutes(minutes).and_then(|delta| start.checked_add_signed(delta))
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

/// Timestamp column wrapper so rows decode straight into `DateTime<Utc>`.
pub(crate) struct StoredTimestamp(pub DateTime<Utc>);

impl FromSql for StoredTimestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        parse_timestamp(raw)
            .map(StoredTimestamp)
            .ok_or_else(|| FromSqlError::Other(format!("unparseable timestamp: {}", raw).into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

impl FromSql for Priority {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Requested,
    Scheduled,
    Cancelled,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingStatus::Requested => "requested",
            MeetingStatus::Scheduled => "scheduled",
            MeetingStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for MeetingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requested" => Ok(MeetingStatus::Requested),
            "scheduled" => Ok(MeetingStatus::Scheduled),
            "cancelled" | "canceled" => Ok(MeetingStatus::Cancelled),
            other => Err(format!("unknown meeting status '{}'", other)),
        }
    }
}

impl FromSql for MeetingStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// A sales prospect. `lead_id` never changes once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub lead_id: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub contact_address: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable qualification decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualificationSnapshot {
    #[serde(skip_serializing)]
    pub id: i64,
    pub lead_id: String,
    pub priority: Priority,
    pub score: i64,
    pub reasoning: String,
    pub next_action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposition_confidence: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reply_analysis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_follow_up: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up_timing: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The single current meeting for a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub meeting_id: i64,
    pub lead_id: String,
    pub status: MeetingStatus,
    pub datetime: Option<DateTime<Utc>>,
    pub meeting_type: Option<String>,
    pub duration_minutes: Option<i64>,
    pub urgency: Option<String>,
    pub preferred_time: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Meeting {
    /// End of the meeting, when both start and duration are known.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        match (self.datetime, self.duration_minutes) {
            (Some(start), Some(minutes)) => add_minutes(start, minutes),
            _ => None,
        }
    }
}

/// Provider-backed calendar artifact linked to a meeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: i64,
    pub meeting_id: i64,
    pub event_id: String,
    pub datetime: DateTime<Utc>,
    pub duration_minutes: i64,
    pub status: String,
    pub link: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: i64,
    pub lead_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentEmail {
    pub id: i64,
    pub lead_id: Option<String>,
    pub to_address: String,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub email_type: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub total_leads: i64,
    pub total_qualifications: i64,
    pub total_meetings: i64,
    pub total_calendar_events: i64,
    pub total_interactions: i64,
    pub total_emails: i64,
    pub database_size_bytes: i64,
}
