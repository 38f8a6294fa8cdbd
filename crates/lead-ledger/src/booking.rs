//! Current meeting per lead, linked calendar events, and booking.
use crate::error::{LedgerError, Result};
use crate::interactions::{InteractionLog, EVENT_MEETING_BOOKED, EVENT_MEETING_CANCELLED};
use crate::ledger_db::schema::{
    add_minutes, format_timestamp, CalendarEvent, EntityKind, Meeting, MeetingStatus, StoredTimestamp,
};
use crate::ledger_db::{Changeset, Entity, EntityStore, Filter, Order};
use crate::providers::{overlaps, CalendarProvider, EventRequest};
use crate::registry::{LeadRegistry, STATUS_UNKNOWN};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

impl Entity for Meeting {
    const KIND: EntityKind = EntityKind::Meeting;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Meeting {
            meeting_id: row.get("id")?,
            lead_id: row.get("lead_id")?,
            status: row.get("status")?,
            datetime: row.get::<_, Option<StoredTimestamp>>("datetime")?.map(|t| t.0),
            meeting_type: row.get("meeting_type")?,
            duration_minutes: row.get("duration_minutes")?,
            urgency: row.get("urgency")?,
            preferred_time: row.get("preferred_time")?,
            notes: row.get("notes")?,
            created_at: row.get::<_, StoredTimestamp>("created_at")?.0,
            updated_at: row.get::<_, StoredTimestamp>("updated_at")?.0,
        })
    }
}

impl Entity for CalendarEvent {
    const KIND: EntityKind = EntityKind::CalendarEvent;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(CalendarEvent {
            id: row.get("id")?,
            meeting_id: row.get("meeting_id")?,
            event_id: row.get("event_id")?,
            datetime: row.get::<_, StoredTimestamp>("datetime")?.0,
            duration_minutes: row.get("duration_minutes")?,
            status: row.get("status")?,
            link: row.get("link")?,
            created_at: row.get::<_, StoredTimestamp>("created_at")?.0,
            updated_at: row.get::<_, StoredTimestamp>("updated_at")?.0,
        })
    }
}

/// Meeting columns to write. Unset fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeetingFields {
    pub status: Option<MeetingStatus>,
    pub datetime: Option<DateTime<Utc>>,
    pub meeting_type: Option<String>,
    pub duration_minutes: Option<i64>,
    pub urgency: Option<String>,
    pub preferred_time: Option<String>,
    pub notes: Option<String>,
}

impl MeetingFields {
    pub fn with_status(status: MeetingStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }
}

struct MeetingChanges<'a> {
    lead_id: &'a str,
    fields: &'a MeetingFields,
}

impl Changeset for MeetingChanges<'_> {
    const KIND: EntityKind = EntityKind::Meeting;

    fn values(&self) -> Vec<(&'static str, Value)> {
        let f = self.fields;
        let mut values = vec![("lead_id", Value::Text(self.lead_id.to_string()))];
        if let Some(status) = f.status {
            values.push(("status", Value::Text(status.as_str().to_string())));
        }
        if let Some(datetime) = &f.datetime {
            values.push(("datetime", Value::Text(format_timestamp(datetime))));
        }
        if let Some(minutes) = f.duration_minutes {
            values.push(("duration_minutes", Value::Integer(minutes)));
        }
        let optional_text = [
            ("meeting_type", &f.meeting_type),
            ("urgency", &f.urgency),
            ("preferred_time", &f.preferred_time),
            ("notes", &f.notes),
        ];
        for (column, value) in optional_text {
            if let Some(v) = value {
                values.push((column, Value::Text(v.clone())));
            }
        }
        values
    }
}

/// A provider event to link to a meeting.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEventFields {
    pub event_id: String,
    pub datetime: DateTime<Utc>,
    pub duration_minutes: i64,
    pub status: String,
    pub link: Option<String>,
}

struct NewCalendarEvent<'a> {
    meeting_id: i64,
    fields: &'a CalendarEventFields,
}

impl Changeset for NewCalendarEvent<'_> {
    const KIND: EntityKind = EntityKind::CalendarEvent;

    fn values(&self) -> Vec<(&'static str, Value)> {
        let f = self.fields;
        let mut values = vec![
            ("meeting_id", Value::Integer(self.meeting_id)),
            ("event_id", Value::Text(f.event_id.clone())),
            ("datetime", Value::Text(format_timestamp(&f.datetime))),
            ("duration_minutes", Value::Integer(f.duration_minutes)),
            ("status", Value::Text(f.status.clone())),
        ];
        if let Some(link) = &f.link {
            values.push(("link", Value::Text(link.clone())));
        }
        values
    }
}

/// Result of a booking attempt. An occupied slot is an expected outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BookingOutcome {
    Booked { meeting_id: i64, event_id: String },
    SlotUnavailable,
}

impl BookingOutcome {
    pub fn is_booked(&self) -> bool {
        matches!(self, BookingOutcome::Booked { .. })
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            BookingOutcome::Booked { event_id, .. } => Some(event_id),
            BookingOutcome::SlotUnavailable => None,
        }
    }
}

#[derive(Clone)]
pub struct MeetingManager {
    store: EntityStore,
    registry: LeadRegistry,
    log: InteractionLog,
}

impl MeetingManager {
    pub fn new(store: EntityStore, registry: LeadRegistry, log: InteractionLog) -> Self {
        Self { store, registry, log }
    }

    /// Merge `fields` into the lead's meeting, creating it when absent.
    /// Returns the meeting id, which stays the same across updates.
    pub fn save_meeting(&self, lead_id: &str, fields: &MeetingFields) -> Result<i64> {
        if let Some(minutes) = fields.duration_minutes {
            if minutes <= 0 {
                return Err(LedgerError::validation(format!(
                    "meeting duration must be positive, got {}",
                    minutes
                )));
            }
        }
        self.registry.ensure_lead(lead_id)?;
        let meeting_id = self
            .store
            .insert_or_update("lead_id", &MeetingChanges { lead_id, fields })?;
        debug!("Saved meeting {} for lead {}", meeting_id, lead_id);
        Ok(meeting_id)
    }

    pub fn latest_meeting(&self, lead_id: &str) -> Result<Option<Meeting>> {
        self.store.get_latest_by_field("lead_id", lead_id)
    }

    pub fn get_meeting(&self, meeting_id: i64) -> Result<Option<Meeting>> {
        Ok(self.store.get_by_field::<Meeting>("id", meeting_id)?.into_iter().next())
    }

    /// Link a provider event to a meeting. Always inserts; returns the
    /// event id.
    pub fn save_calendar_event(&self, meeting_id: i64, fields: &CalendarEventFields) -> Result<String> {
        if fields.event_id.trim().is_empty() {
            return Err(LedgerError::validation("calendar event id must not be empty"));
        }
        if self.get_meeting(meeting_id)?.is_none() {
            return Err(LedgerError::not_found("meeting", meeting_id.to_string()));
        }
        self.store.append(&NewCalendarEvent { meeting_id, fields })?;
        debug!("Linked event {} to meeting {}", fields.event_id, meeting_id);
        Ok(fields.event_id.clone())
    }

    /// Events linked to a meeting, oldest first.
    pub fn calendar_events(&self, meeting_id: i64) -> Result<Vec<CalendarEvent>> {
        self.store
            .query(&[Filter::eq("meeting_id", meeting_id)], &Order::asc("created_at"))
    }

    /// The authoritative event for display.
    pub fn latest_calendar_event(&self, meeting_id: i64) -> Result<Option<CalendarEvent>> {
        self.store.get_latest_by_field("meeting_id", meeting_id)
    }

    pub fn cancel_meeting(&self, lead_id: &str, reason: Option<&str>) -> Result<Meeting> {
        let meeting = self
            .latest_meeting(lead_id)?
            .ok_or_else(|| LedgerError::not_found("meeting", lead_id))?;
        let fields = MeetingFields {
            status: Some(MeetingStatus::Cancelled),
            notes: reason.map(str::to_string),
            ..Default::default()
        };
        self.save_meeting(lead_id, &fields)?;
        self.log.append(
            lead_id,
            EVENT_MEETING_CANCELLED,
            &json!({
                "meeting_id": meeting.meeting_id,
                "previous_status": meeting.status,
                "reason": reason,
            }),
        )?;
        info!("Cancelled meeting {} for lead {}", meeting.meeting_id, lead_id);
        self.require_meeting(meeting.meeting_id)
    }

    fn require_meeting(&self, meeting_id: i64) -> Result<Meeting> {
        self.get_meeting(meeting_id)?
            .ok_or_else(|| LedgerError::not_found("meeting", meeting_id.to_string()))
    }

    /// Scheduled meetings with no linked calendar event: bookings whose
    /// provider write never completed.
    pub fn unconfirmed_bookings(&self) -> Result<Vec<Meeting>> {
        let scheduled: Vec<Meeting> = self.store.query(
            &[Filter::eq("status", MeetingStatus::Scheduled.as_str())],
            &Order::asc("datetime"),
        )?;
        let mut unconfirmed = Vec::new();
        for meeting in scheduled {
            let linked = self.store.count(
                EntityKind::CalendarEvent,
                &[Filter::eq("meeting_id", meeting.meeting_id)],
            )?;
            if linked == 0 {
                unconfirmed.push(meeting);
            }
        }
        Ok(unconfirmed)
    }

    /// Scheduled meetings overlapping `[start, end)`. A meeting without a
    /// duration occupies only its start instant.
    pub fn scheduled_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Meeting>> {
        let candidates: Vec<Meeting> = self.store.query(
            &[
                Filter::eq("status", MeetingStatus::Scheduled.as_str()),
                Filter::lt("datetime", format_timestamp(&end)),
            ],
            &Order::asc("datetime"),
        )?;
        Ok(candidates
            .into_iter()
            .filter(|m| match (m.datetime, m.end()) {
                (Some(s), Some(e)) => overlaps(start, end, s, e),
                (Some(s), None) => start <= s && s < end,
                _ => false,
            })
            .collect())
    }

    pub async fn book(
        &self,
        calendar: &dyn CalendarProvider,
        lead_id: &str,
        start: DateTime<Utc>,
        duration_minutes: i64,
        meeting_type: &str,
    ) -> Result<BookingOutcome> {
        self.book_at(calendar, lead_id, start, duration_minutes, meeting_type, Utc::now())
            .await
    }

    /// Book a slot, checking availability before any write.
    ///
    /// Once the slot is confirmed free the meeting is saved, the provider
    /// event created, the event linked and a `meeting_booked` entry logged,
    /// in that order. A provider failure during event creation leaves the
    /// meeting scheduled with no linked event; see `unconfirmed_bookings`.
    pub async fn book_at(
        &self,
        calendar: &dyn CalendarProvider,
        lead_id: &str,
        start: DateTime<Utc>,
        duration_minutes: i64,
        meeting_type: &str,
        now: DateTime<Utc>,
    ) -> Result<BookingOutcome> {
        if duration_minutes <= 0 {
            return Err(LedgerError::validation(format!(
                "meeting duration must be positive, got {}",
                duration_minutes
            )));
        }
        if lead_id.trim().is_empty() {
            return Err(LedgerError::validation("lead id must not be empty"));
        }
        if start < now {
            return Err(LedgerError::validation(format!(
                "cannot book a meeting in the past: {}",
                format_timestamp(&start)
            )));
        }
        let end = add_minutes(start, duration_minutes).ok_or_else(|| {
            LedgerError::validation(format!("meeting duration {} minutes is out of range", duration_minutes))
        })?;

        if !calendar.is_slot_free(start, end).await? {
            warn!("Slot {} for lead {} is taken, not booking", format_timestamp(&start), lead_id);
            return Ok(BookingOutcome::SlotUnavailable);
        }

        let meeting_id = self.save_meeting(
            lead_id,
            &MeetingFields {
                status: Some(MeetingStatus::Scheduled),
                datetime: Some(start),
                meeting_type: Some(meeting_type.to_string()),
                duration_minutes: Some(duration_minutes),
                ..Default::default()
            },
        )?;

        let attendees = self
            .registry
            .get_lead(lead_id)?
            .filter(|lead| lead.status != STATUS_UNKNOWN)
            .map(|lead| vec![lead.contact_address])
            .unwrap_or_default();
        let request = EventRequest {
            start,
            end,
            attendees,
            summary: format!("{} meeting", meeting_type),
            notes: format!("lead {}", lead_id),
        };
        let event_id = match calendar.create_event(&request).await {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    "Calendar event creation failed for meeting {} ({}); booking left unconfirmed",
                    meeting_id, e
                );
                return Err(e.into());
            }
        };

        self.save_calendar_event(
            meeting_id,
            &CalendarEventFields {
                event_id: event_id.clone(),
                datetime: start,
                duration_minutes,
                status: MeetingStatus::Scheduled.as_str().to_string(),
                link: None,
            },
        )?;
        self.log.append(
            lead_id,
            EVENT_MEETING_BOOKED,
            &json!({
                "meeting_id": meeting_id,
                "event_id": event_id,
                "datetime": format_timestamp(&start),
                "duration_minutes": duration_minutes,
                "meeting_type": meeting_type,
            }),
        )?;
        info!(
            "Booked meeting {} for lead {} at {} (event {})",
            meeting_id,
            lead_id,
            format_timestamp(&start),
            event_id
        );
        Ok(BookingOutcome::Booked { meeting_id, event_id })
    }
}
