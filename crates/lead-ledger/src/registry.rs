//! Lead identity: one stable `lead_id` per contact address.
use crate::error::{LedgerError, Result, StorageError};
use crate::ledger_db::schema::{EntityKind, Lead, StoredTimestamp};
use crate::ledger_db::{Changeset, Entity, EntityStore, Order};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub const STATUS_NEW: &str = "new";
pub const STATUS_UNKNOWN: &str = "unknown";

/// Display attributes supplied alongside a contact address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadAttributes {
    pub name: Option<String>,
    pub company: Option<String>,
}

impl LeadAttributes {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), company: None }
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }
}

impl Entity for Lead {
    const KIND: EntityKind = EntityKind::Lead;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Lead {
            lead_id: row.get("lead_id")?,
            name: row.get("name")?,
            company: row.get("company")?,
            contact_address: row.get("contact_address")?,
            status: row.get("status")?,
            created_at: row.get::<_, StoredTimestamp>("created_at")?.0,
            updated_at: row.get::<_, StoredTimestamp>("updated_at")?.0,
        })
    }
}

/// Columns written for a lead. Unset fields are left untouched on update.
#[derive(Debug, Default)]
struct LeadChanges<'a> {
    lead_id: &'a str,
    contact_address: Option<&'a str>,
    name: Option<&'a str>,
    company: Option<&'a str>,
    status: Option<&'a str>,
}

impl Changeset for LeadChanges<'_> {
    const KIND: EntityKind = EntityKind::Lead;

    fn values(&self) -> Vec<(&'static str, Value)> {
        let mut values = vec![("lead_id", Value::Text(self.lead_id.to_string()))];
        let optional = [
            ("contact_address", self.contact_address),
            ("name", self.name),
            ("company", self.company),
            ("status", self.status),
        ];
        for (column, value) in optional {
            if let Some(v) = value {
                values.push((column, Value::Text(v.to_string())));
            }
        }
        values
    }
}

/// Trimmed, lower-cased contact address. Empty input is rejected.
pub fn normalize_contact(contact: &str) -> Result<String> {
    let normalized = contact.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(LedgerError::validation("contact address must not be empty"));
    }
    Ok(normalized)
}

fn new_lead_id() -> String {
    format!("lead_{}", Uuid::new_v4().simple())
}

#[derive(Clone)]
pub struct LeadRegistry {
    store: EntityStore,
}

impl LeadRegistry {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    /// Return the lead id for `contact`, creating the lead on first sight.
    ///
    /// Repeated calls with the same address always return the same id, even
    /// when `attrs` differ. Concurrent first calls race on the unique
    /// contact column; the loser re-reads the winner's row.
    pub fn resolve_or_create(&self, contact: &str, attrs: &LeadAttributes) -> Result<String> {
        let contact = normalize_contact(contact)?;
        if let Some(existing) = self.find_by_contact(&contact)? {
            debug!("Resolved {} to existing lead {}", contact, existing.lead_id);
            return Ok(existing.lead_id);
        }

        let lead_id = new_lead_id();
        let inserted = self.store.insert_or_ignore(&LeadChanges {
            lead_id: &lead_id,
            contact_address: Some(&contact),
            name: attrs.name.as_deref(),
            company: attrs.company.as_deref(),
            status: Some(STATUS_NEW),
        })?;
        if inserted {
            info!("Registered new lead {} for {}", lead_id, contact);
            return Ok(lead_id);
        }

        debug!("Lost registration race for {}, re-reading", contact);
        self.find_by_contact(&contact)?
            .map(|lead| lead.lead_id)
            .ok_or_else(|| {
                StorageError::Corrupt {
                    table: "leads",
                    detail: format!("insert for {} conflicted but no row exists", contact),
                }
                .into()
            })
    }

    /// Make sure `lead_id` exists, creating a placeholder lead with status
    /// `unknown` when it does not. Never fails because the lead is missing.
    pub fn ensure_lead(&self, lead_id: &str) -> Result<()> {
        if lead_id.trim().is_empty() {
            return Err(LedgerError::validation("lead id must not be empty"));
        }
        if self.get_lead(lead_id)?.is_some() {
            return Ok(());
        }
        let placeholder = format!("unknown+{}@placeholder.invalid", Uuid::new_v4().simple());
        if self.store.insert_or_ignore(&LeadChanges {
            lead_id,
            contact_address: Some(&placeholder),
            status: Some(STATUS_UNKNOWN),
            ..Default::default()
        })? {
            info!("Created placeholder lead {}", lead_id);
            return Ok(());
        }
        // Another writer registered the same id between the read and the insert.
        match self.get_lead(lead_id)? {
            Some(_) => Ok(()),
            None => Err(StorageError::Corrupt {
                table: "leads",
                detail: format!("placeholder insert for {} conflicted but no row exists", lead_id),
            }
            .into()),
        }
    }

    pub fn get_lead(&self, lead_id: &str) -> Result<Option<Lead>> {
        Ok(self.store.get_by_field::<Lead>("lead_id", lead_id)?.into_iter().next())
    }

    /// Like `get_lead`, but a missing lead is an error.
    pub fn require_lead(&self, lead_id: &str) -> Result<Lead> {
        self.get_lead(lead_id)?
            .ok_or_else(|| LedgerError::not_found("lead", lead_id))
    }

    pub fn find_by_contact(&self, contact: &str) -> Result<Option<Lead>> {
        let contact = normalize_contact(contact)?;
        Ok(self
            .store
            .get_by_field::<Lead>("contact_address", contact)?
            .into_iter()
            .next())
    }

    /// Every lead, most recently updated first.
    pub fn all_leads(&self) -> Result<Vec<Lead>> {
        self.store.query(&[], &Order::desc("updated_at"))
    }

    /// Overwrite display attributes. The id and contact address never change.
    pub fn refresh_attributes(&self, lead_id: &str, attrs: &LeadAttributes) -> Result<()> {
        self.require_lead(lead_id)?;
        if attrs.name.is_none() && attrs.company.is_none() {
            return Ok(());
        }
        self.store.insert_or_update(
            "lead_id",
            &LeadChanges {
                lead_id,
                name: attrs.name.as_deref(),
                company: attrs.company.as_deref(),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    pub fn update_status(&self, lead_id: &str, status: &str) -> Result<()> {
        if status.trim().is_empty() {
            return Err(LedgerError::validation("status must not be empty"));
        }
        self.require_lead(lead_id)?;
        self.store.insert_or_update(
            "lead_id",
            &LeadChanges { lead_id, status: Some(status), ..Default::default() },
        )?;
        info!("Lead {} status -> {}", lead_id, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_db::LeadDatabase;
    use std::sync::Arc;

    fn registry(db: &LeadDatabase) -> LeadRegistry {
        LeadRegistry::new(db.entities.clone())
    }

    #[test]
    fn test_same_contact_resolves_to_same_id() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let registry = registry(&db);
        let first = registry
            .resolve_or_create("alice@acme.com", &LeadAttributes::named("Alice"))
            .unwrap();
        let second = registry
            .resolve_or_create("alice@acme.com", &LeadAttributes::named("Alice Cooper").with_company("Acme"))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.all_leads().unwrap().len(), 1);

        let lead = registry.get_lead(&first).unwrap().unwrap();
        assert_eq!(lead.status, STATUS_NEW);
        assert_eq!(lead.name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_contact_is_normalized() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let registry = registry(&db);
        let a = registry.resolve_or_create("  Bob@Example.COM ", &LeadAttributes::default()).unwrap();
        let b = registry.resolve_or_create("bob@example.com", &LeadAttributes::default()).unwrap();
        assert_eq!(a, b);
        assert!(registry.resolve_or_create("   ", &LeadAttributes::default()).unwrap_err().is_validation());
    }

    #[test]
    fn test_distinct_contacts_get_distinct_ids() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let registry = registry(&db);
        let a = registry.resolve_or_create("a@x.io", &LeadAttributes::default()).unwrap();
        let b = registry.resolve_or_create("b@x.io", &LeadAttributes::default()).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("lead_"));
    }

    #[test]
    fn test_refresh_keeps_identity() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let registry = registry(&db);
        let id = registry.resolve_or_create("c@x.io", &LeadAttributes::named("C")).unwrap();
        registry
            .refresh_attributes(&id, &LeadAttributes::default().with_company("Initech"))
            .unwrap();
        let lead = registry.require_lead(&id).unwrap();
        assert_eq!(lead.lead_id, id);
        assert_eq!(lead.name.as_deref(), Some("C"));
        assert_eq!(lead.company.as_deref(), Some("Initech"));
    }

    #[test]
    fn test_ensure_lead_creates_placeholder_once() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let registry = registry(&db);
        registry.ensure_lead("lead_external").unwrap();
        registry.ensure_lead("lead_external").unwrap();
        let lead = registry.require_lead("lead_external").unwrap();
        assert_eq!(lead.status, STATUS_UNKNOWN);
        assert_eq!(registry.all_leads().unwrap().len(), 1);
    }

    #[test]
    fn test_placeholders_for_ids_differing_in_case() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let registry = registry(&db);
        registry.ensure_lead("lead_x").unwrap();
        registry.ensure_lead("LEAD_X").unwrap();

        let lower = registry.require_lead("lead_x").unwrap();
        let upper = registry.require_lead("LEAD_X").unwrap();
        assert_ne!(lower.contact_address, upper.contact_address);
        assert_eq!(registry.all_leads().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_lead_lookups() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let registry = registry(&db);
        assert!(registry.get_lead("nope").unwrap().is_none());
        assert!(matches!(
            registry.update_status("nope", "qualified").unwrap_err(),
            LedgerError::NotFound { kind: "lead", .. }
        ));
    }

    #[test]
    fn test_concurrent_registration_yields_one_lead() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(LeadDatabase::new(&dir.path().join("race.db")).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    LeadRegistry::new(db.entities.clone())
                        .resolve_or_create("race@x.io", &LeadAttributes::named(format!("caller {}", i)))
                        .unwrap()
                })
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(db.stats().unwrap().total_leads, 1);
    }
}
