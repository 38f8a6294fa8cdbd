//! Audit trail: the interaction log and the outbound email log.
use crate::error::{LedgerError, Result};
use crate::ledger_db::schema::{EntityKind, Interaction, SentEmail, StoredTimestamp};
use crate::ledger_db::{Changeset, Entity, EntityStore, Filter, Order};
use crate::registry::LeadRegistry;
use rusqlite::types::{Type, Value};
use rusqlite::Row;
use serde::Serialize;
use tracing::{debug, info};

pub const EVENT_MEETING_BOOKED: &str = "meeting_booked";
pub const EVENT_MEETING_CANCELLED: &str = "meeting_cancelled";
pub const EVENT_QUALIFIED: &str = "qualified";

impl Entity for Interaction {
    const KIND: EntityKind = EntityKind::Interaction;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let raw: String = row.get("event_data")?;
        let event_data = serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
        Ok(Interaction {
            id: row.get("id")?,
            lead_id: row.get("lead_id")?,
            event_type: row.get("event_type")?,
            event_data,
            timestamp: row.get::<_, StoredTimestamp>("timestamp")?.0,
        })
    }
}

impl Entity for SentEmail {
    const KIND: EntityKind = EntityKind::Email;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(SentEmail {
            id: row.get("id")?,
            lead_id: row.get("lead_id")?,
            to_address: row.get("to_address")?,
            from_address: row.get("from_address")?,
            subject: row.get("subject")?,
            body: row.get("body")?,
            email_type: row.get("email_type")?,
            sent_at: row.get::<_, StoredTimestamp>("sent_at")?.0,
        })
    }
}

struct NewInteraction<'a> {
    lead_id: &'a str,
    event_type: &'a str,
    event_data: String,
}

impl Changeset for NewInteraction<'_> {
    const KIND: EntityKind = EntityKind::Interaction;

    fn values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("lead_id", Value::Text(self.lead_id.to_string())),
            ("event_type", Value::Text(self.event_type.to_string())),
            ("event_data", Value::Text(self.event_data.clone())),
        ]
    }
}

/// An email handed to the outbound log.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub lead_id: Option<String>,
    pub to_address: String,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub email_type: String,
}

impl OutgoingEmail {
    pub fn new(to_address: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            lead_id: None,
            to_address: to_address.into(),
            from_address: None,
            subject: None,
            body: body.into(),
            email_type: "outbound".to_string(),
        }
    }

    pub fn for_lead(mut self, lead_id: impl Into<String>) -> Self {
        self.lead_id = Some(lead_id.into());
        self
    }

    pub fn from(mut self, from_address: impl Into<String>) -> Self {
        self.from_address = Some(from_address.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn kind(mut self, email_type: impl Into<String>) -> Self {
        self.email_type = email_type.into();
        self
    }
}

impl Changeset for OutgoingEmail {
    const KIND: EntityKind = EntityKind::Email;

    fn values(&self) -> Vec<(&'static str, Value)> {
        let mut values = vec![
            ("to_address", Value::Text(self.to_address.clone())),
            ("body", Value::Text(self.body.clone())),
            ("email_type", Value::Text(self.email_type.clone())),
        ];
        let optional = [
            ("lead_id", &self.lead_id),
            ("from_address", &self.from_address),
            ("subject", &self.subject),
        ];
        for (column, value) in optional {
            if let Some(v) = value {
                values.push((column, Value::Text(v.clone())));
            }
        }
        values
    }
}

/// Append-only event log per lead. Entries are never updated or pruned.
#[derive(Clone)]
pub struct InteractionLog {
    store: EntityStore,
    registry: LeadRegistry,
}

impl InteractionLog {
    pub fn new(store: EntityStore, registry: LeadRegistry) -> Self {
        Self { store, registry }
    }

    /// Record `event_type` with a JSON payload. Returns the entry id.
    pub fn append<T: Serialize + ?Sized>(&self, lead_id: &str, event_type: &str, data: &T) -> Result<i64> {
        if event_type.trim().is_empty() {
            return Err(LedgerError::validation("event type must not be empty"));
        }
        let event_data = serde_json::to_string(data)?;
        self.registry.ensure_lead(lead_id)?;
        let id = self.store.append(&NewInteraction { lead_id, event_type, event_data })?;
        debug!("Logged {} for lead {}", event_type, lead_id);
        Ok(id)
    }

    /// Entries for a lead, oldest first.
    pub fn history(&self, lead_id: &str) -> Result<Vec<Interaction>> {
        self.store
            .query(&[Filter::eq("lead_id", lead_id)], &Order::asc("timestamp"))
    }

    pub fn history_of_type(&self, lead_id: &str, event_type: &str) -> Result<Vec<Interaction>> {
        self.store.query(
            &[Filter::eq("lead_id", lead_id), Filter::eq("event_type", event_type)],
            &Order::asc("timestamp"),
        )
    }

    pub fn log_sent_email(&self, email: &OutgoingEmail) -> Result<i64> {
        if email.to_address.trim().is_empty() {
            return Err(LedgerError::validation("recipient address must not be empty"));
        }
        if let Some(lead_id) = &email.lead_id {
            self.registry.ensure_lead(lead_id)?;
        }
        let id = self.store.append(email)?;
        info!("Logged {} email to {}", email.email_type, email.to_address);
        Ok(id)
    }

    /// Sent emails, newest first, optionally for a single lead.
    pub fn sent_emails(&self, lead_id: Option<&str>) -> Result<Vec<SentEmail>> {
        let filters: Vec<Filter> = lead_id.map(|id| Filter::eq("lead_id", id)).into_iter().collect();
        self.store.query(&filters, &Order::desc("sent_at"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_db::LeadDatabase;
    use serde_json::json;

    fn log(db: &LeadDatabase) -> InteractionLog {
        InteractionLog::new(db.entities.clone(), LeadRegistry::new(db.entities.clone()))
    }

    #[test]
    fn test_history_is_in_append_order() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let log = log(&db);
        log.append("lead_a", "meeting_requested", &json!({"preferred": "morning"})).unwrap();
        log.append("lead_a", EVENT_MEETING_BOOKED, &json!({"meeting_id": 1})).unwrap();
        log.append("lead_b", "noise", &json!(null)).unwrap();

        let history = log.history("lead_a").unwrap();
        let types: Vec<&str> = history.iter().map(|i| i.event_type.as_str()).collect();
        assert_eq!(types, ["meeting_requested", EVENT_MEETING_BOOKED]);
        assert_eq!(history[1].event_data["meeting_id"], 1);
        assert!(history[0].timestamp <= history[1].timestamp);
    }

    #[test]
    fn test_filter_by_type() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let log = log(&db);
        log.append("lead_a", EVENT_QUALIFIED, &json!({"score": 40})).unwrap();
        log.append("lead_a", EVENT_MEETING_BOOKED, &json!({})).unwrap();
        log.append("lead_a", EVENT_QUALIFIED, &json!({"score": 60})).unwrap();
        let qualified = log.history_of_type("lead_a", EVENT_QUALIFIED).unwrap();
        assert_eq!(qualified.len(), 2);
        assert_eq!(qualified[1].event_data["score"], 60);
    }

    #[test]
    fn test_blank_event_type_rejected() {
        let db = LeadDatabase::new_in_memory().unwrap();
        assert!(log(&db).append("lead_a", " ", &json!({})).unwrap_err().is_validation());
        assert_eq!(db.stats().unwrap().total_interactions, 0);
    }

    #[test]
    fn test_sent_emails_newest_first() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let log = log(&db);
        log.log_sent_email(&OutgoingEmail::new("a@x.io", "hello").for_lead("lead_a").subject("Intro"))
            .unwrap();
        log.log_sent_email(&OutgoingEmail::new("a@x.io", "following up").for_lead("lead_a").kind("follow_up"))
            .unwrap();
        log.log_sent_email(&OutgoingEmail::new("b@x.io", "cold").from("sales@us.io")).unwrap();

        let for_a = log.sent_emails(Some("lead_a")).unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].email_type, "follow_up");
        assert_eq!(for_a[1].subject.as_deref(), Some("Intro"));

        let all = log.sent_emails(None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].from_address.as_deref(), Some("sales@us.io"));
        assert_eq!(all[0].lead_id, None);
    }
}
