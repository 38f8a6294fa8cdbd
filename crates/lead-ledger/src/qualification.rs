//! Append-only qualification history.
//!
//! Qualifying a lead again never touches an earlier snapshot: every call
//! inserts a new row, and "current" is simply the row with the greatest
//! timestamp (row id breaks ties).
use crate::error::{LedgerError, Result};
use crate::ledger_db::schema::{
    format_timestamp, EntityKind, Meeting, MeetingStatus, Priority, QualificationSnapshot,
    StoredTimestamp,
};
use crate::ledger_db::{Changeset, Entity, EntityStore, Filter, Order};
use crate::providers::FieldMap;
use crate::registry::LeadRegistry;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

/// The closed, validated record accepted by `append_snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct QualificationFields {
    pub priority: Priority,
    #[validate(range(min = 0, max = 100))]
    pub score: i64,
    #[validate(length(min = 1))]
    pub reasoning: String,
    #[validate(length(min = 1))]
    pub next_action: String,
    pub disposition: Option<String>,
    #[validate(range(min = 0, max = 100))]
    pub disposition_confidence: Option<i64>,
    pub sentiment: Option<String>,
    pub urgency: Option<String>,
    pub last_reply_analysis: Option<String>,
    pub recommended_follow_up: Option<String>,
    pub follow_up_timing: Option<String>,
}

impl QualificationFields {
    pub fn new(
        priority: Priority,
        score: i64,
        reasoning: impl Into<String>,
        next_action: impl Into<String>,
    ) -> Self {
        Self {
            priority,
            score,
            reasoning: reasoning.into(),
            next_action: next_action.into(),
            disposition: None,
            disposition_confidence: None,
            sentiment: None,
            urgency: None,
            last_reply_analysis: None,
            recommended_follow_up: None,
            follow_up_timing: None,
        }
    }

    pub fn with_disposition(mut self, disposition: impl Into<String>, confidence: i64) -> Self {
        self.disposition = Some(disposition.into());
        self.disposition_confidence = Some(confidence);
        self
    }

    pub fn with_sentiment(mut self, sentiment: impl Into<String>) -> Self {
        self.sentiment = Some(sentiment.into());
        self
    }

    pub fn with_urgency(mut self, urgency: impl Into<String>) -> Self {
        self.urgency = Some(urgency.into());
        self
    }

    pub fn with_reply_analysis(mut self, analysis: impl Into<String>) -> Self {
        self.last_reply_analysis = Some(analysis.into());
        self
    }

    pub fn with_follow_up(mut self, recommended: impl Into<String>, timing: impl Into<String>) -> Self {
        self.recommended_follow_up = Some(recommended.into());
        self.follow_up_timing = Some(timing.into());
        self
    }

    /// Convert a text analysis field map into a validated record.
    ///
    /// Required fields must be present and well formed; nothing is filled
    /// in with defaults. Empty optional values count as unset and
    /// unrecognised keys are ignored.
    pub fn from_field_map(map: &FieldMap) -> Result<Self> {
        let required = |keys: &[&str]| -> Result<String> {
            lookup(map, keys).ok_or_else(|| {
                LedgerError::validation(format!("missing required field '{}'", keys[0]))
            })
        };

        let priority = required(&["priority"])?
            .parse::<Priority>()
            .map_err(LedgerError::Validation)?;
        let score = parse_integer("score", &required(&["score", "lead_score"])?)?;
        let disposition_confidence = lookup(map, &["disposition_confidence"])
            .map(|raw| parse_integer("disposition_confidence", &raw))
            .transpose()?;

        let fields = Self {
            priority,
            score,
            reasoning: required(&["reasoning"])?,
            next_action: required(&["next_action"])?,
            disposition: lookup(map, &["disposition", "lead_disposition"]),
            disposition_confidence,
            sentiment: lookup(map, &["sentiment"]),
            urgency: lookup(map, &["urgency"]),
            last_reply_analysis: lookup(map, &["last_reply_analysis"]),
            recommended_follow_up: lookup(map, &["recommended_follow_up"]),
            follow_up_timing: lookup(map, &["follow_up_timing"]),
        };
        fields.check()?;
        Ok(fields)
    }

    /// Field-level validation plus the blank-text rule the derive cannot express.
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        if self.reasoning.trim().is_empty() || self.next_action.trim().is_empty() {
            return Err(LedgerError::validation("reasoning and next_action must not be blank"));
        }
        Ok(())
    }
}

fn lookup(map: &FieldMap, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_integer(field: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| LedgerError::validation(format!("field '{}' is not an integer: '{}'", field, raw)))
}

impl Entity for QualificationSnapshot {
    const KIND: EntityKind = EntityKind::Qualification;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(QualificationSnapshot {
            id: row.get("id")?,
            lead_id: row.get("lead_id")?,
            priority: row.get("priority")?,
            score: row.get("score")?,
            reasoning: row.get("reasoning")?,
            next_action: row.get("next_action")?,
            disposition: row.get("disposition")?,
            disposition_confidence: row.get("disposition_confidence")?,
            sentiment: row.get("sentiment")?,
            urgency: row.get("urgency")?,
            last_reply_analysis: row.get("last_reply_analysis")?,
            recommended_follow_up: row.get("recommended_follow_up")?,
            follow_up_timing: row.get("follow_up_timing")?,
            created_at: row.get::<_, StoredTimestamp>("created_at")?.0,
            updated_at: row.get::<_, StoredTimestamp>("updated_at")?.0,
        })
    }
}

struct NewSnapshot<'a> {
    lead_id: &'a str,
    fields: &'a QualificationFields,
    stamped_at: DateTime<Utc>,
}

impl Changeset for NewSnapshot<'_> {
    const KIND: EntityKind = EntityKind::Qualification;

    fn values(&self) -> Vec<(&'static str, Value)> {
        let f = self.fields;
        let stamp = format_timestamp(&self.stamped_at);
        let mut values = vec![
            ("lead_id", Value::Text(self.lead_id.to_string())),
            ("priority", Value::Text(f.priority.as_str().to_string())),
            ("score", Value::Integer(f.score)),
            ("reasoning", Value::Text(f.reasoning.clone())),
            ("next_action", Value::Text(f.next_action.clone())),
            ("created_at", Value::Text(stamp.clone())),
            ("updated_at", Value::Text(stamp)),
        ];
        let optional_text = [
            ("disposition", &f.disposition),
            ("sentiment", &f.sentiment),
            ("urgency", &f.urgency),
            ("last_reply_analysis", &f.last_reply_analysis),
            ("recommended_follow_up", &f.recommended_follow_up),
            ("follow_up_timing", &f.follow_up_timing),
        ];
        for (column, value) in optional_text {
            if let Some(v) = value {
                values.push((column, Value::Text(v.clone())));
            }
        }
        if let Some(confidence) = f.disposition_confidence {
            values.push(("disposition_confidence", Value::Integer(confidence)));
        }
        values
    }
}

/// Meeting fields overlaid on a qualification view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeetingOverlay {
    pub meeting_status: MeetingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_datetime: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_urgency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_preferred_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_notes: Option<String>,
}

impl From<Meeting> for MeetingOverlay {
    fn from(m: Meeting) -> Self {
        Self {
            meeting_status: m.status,
            meeting_datetime: m.datetime,
            meeting_type: m.meeting_type,
            meeting_duration: m.duration_minutes,
            meeting_urgency: m.urgency,
            meeting_preferred_time: m.preferred_time,
            meeting_notes: m.notes,
        }
    }
}

/// Latest qualification with the current meeting merged in, for one-read
/// display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadOverview {
    #[serde(flatten)]
    pub qualification: QualificationSnapshot,
    #[serde(flatten)]
    pub meeting: Option<MeetingOverlay>,
}

#[derive(Clone)]
pub struct QualificationHistory {
    store: EntityStore,
    registry: LeadRegistry,
}

impl QualificationHistory {
    pub fn new(store: EntityStore, registry: LeadRegistry) -> Self {
        Self { store, registry }
    }

    /// Validate and append a new snapshot stamped with the current time.
    /// A missing lead is created as a placeholder first.
    pub fn append_snapshot(
        &self,
        lead_id: &str,
        fields: &QualificationFields,
    ) -> Result<QualificationSnapshot> {
        fields.check()?;
        self.registry.ensure_lead(lead_id)?;

        let rowid = self.store.append(&NewSnapshot {
            lead_id,
            fields,
            stamped_at: Utc::now(),
        })?;
        info!(
            "Appended qualification {} for lead {} (priority {}, score {})",
            rowid,
            lead_id,
            fields.priority.as_str(),
            fields.score
        );
        self.store
            .get_by_field::<QualificationSnapshot>("id", rowid)?
            .into_iter()
            .next()
            .ok_or_else(|| LedgerError::not_found("qualification", rowid.to_string()))
    }

    /// Most recent snapshot only; optional fields are whatever that snapshot
    /// set, never merged across history.
    pub fn latest(&self, lead_id: &str) -> Result<Option<QualificationSnapshot>> {
        self.store.get_latest_by_field("lead_id", lead_id)
    }

    /// Every snapshot, oldest first.
    pub fn history(&self, lead_id: &str) -> Result<Vec<QualificationSnapshot>> {
        let snapshots: Vec<QualificationSnapshot> = self.store.query(
            &[Filter::eq("lead_id", lead_id)],
            &Order::asc("updated_at"),
        )?;
        debug!("Loaded {} snapshots for lead {}", snapshots.len(), lead_id);
        Ok(snapshots)
    }

    pub fn has_qualification(&self, lead_id: &str) -> Result<bool> {
        Ok(self.latest(lead_id)?.is_some())
    }

    pub fn merged_with_meeting(&self, lead_id: &str) -> Result<Option<LeadOverview>> {
        let Some(qualification) = self.latest(lead_id)? else {
            return Ok(None);
        };
        let meeting = self
            .store
            .get_latest_by_field::<Meeting>("lead_id", lead_id)?
            .map(MeetingOverlay::from);
        Ok(Some(LeadOverview { qualification, meeting }))
    }

    /// Append a snapshot derived from the latest one after a booking attempt.
    pub fn rescore_after_booking(&self, lead_id: &str, booked: bool) -> Result<QualificationSnapshot> {
        let latest = self
            .latest(lead_id)?
            .ok_or_else(|| LedgerError::not_found("qualification", lead_id))?;

        let mut fields = QualificationFields {
            priority: latest.priority,
            score: latest.score,
            reasoning: latest.reasoning,
            next_action: latest.next_action,
            disposition: latest.disposition,
            disposition_confidence: latest.disposition_confidence,
            sentiment: latest.sentiment,
            urgency: latest.urgency,
            last_reply_analysis: latest.last_reply_analysis,
            recommended_follow_up: latest.recommended_follow_up,
            follow_up_timing: latest.follow_up_timing,
        };
        if booked {
            fields.score = (fields.score + 10).min(100);
            fields.priority = Priority::High;
            fields.next_action = "follow_up".to_string();
            fields.reasoning = "Meeting successfully booked. Increased lead score and priority.".to_string();
        } else {
            fields.score = (fields.score - 5).max(0);
            fields.priority = Priority::Medium;
            fields.next_action = "nurture".to_string();
            fields.reasoning = "Booking failed or not confirmed. Lowered lead score and priority.".to_string();
        }
        self.append_snapshot(lead_id, &fields)
    }
}
