//! Composition root wiring the ledger components to one database and the
//! external providers.
use crate::booking::{BookingOutcome, MeetingManager};
use crate::error::Result;
use crate::interactions::{InteractionLog, EVENT_QUALIFIED};
use crate::ledger_db::schema::QualificationSnapshot;
use crate::ledger_db::LeadDatabase;
use crate::providers::{AnalysisRequest, CalendarProvider, LocalCalendar, TextAnalysisProvider};
use crate::qualification::{QualificationFields, QualificationHistory};
use crate::registry::{LeadAttributes, LeadRegistry};
use crate::scheduler::{ProposedSlot, SchedulerConfig, SlotPreferences, SlotScheduler};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub struct LeadEngine {
    db: Arc<LeadDatabase>,
    registry: LeadRegistry,
    history: QualificationHistory,
    log: InteractionLog,
    meetings: MeetingManager,
    scheduler: SlotScheduler,
    calendar: Arc<dyn CalendarProvider>,
    analyzer: Arc<dyn TextAnalysisProvider>,
}

impl LeadEngine {
    pub fn new(
        db: Arc<LeadDatabase>,
        config: SchedulerConfig,
        calendar: Arc<dyn CalendarProvider>,
        analyzer: Arc<dyn TextAnalysisProvider>,
    ) -> Result<Self> {
        let store = db.entities.clone();
        let registry = LeadRegistry::new(store.clone());
        let history = QualificationHistory::new(store.clone(), registry.clone());
        let log = InteractionLog::new(store.clone(), registry.clone());
        let meetings = MeetingManager::new(store, registry.clone(), log.clone());
        let scheduler = SlotScheduler::new(config, Arc::clone(&calendar))?;
        Ok(Self { db, registry, history, log, meetings, scheduler, calendar, analyzer })
    }

    /// Engine whose calendar is the ledger's own scheduled meetings.
    pub fn with_local_calendar(
        db: Arc<LeadDatabase>,
        config: SchedulerConfig,
        analyzer: Arc<dyn TextAnalysisProvider>,
    ) -> Result<Self> {
        let registry = LeadRegistry::new(db.entities.clone());
        let log = InteractionLog::new(db.entities.clone(), registry.clone());
        let calendar = LocalCalendar::new(MeetingManager::new(db.entities.clone(), registry, log));
        Self::new(db, config, Arc::new(calendar), analyzer)
    }

    pub fn database(&self) -> &LeadDatabase {
        &self.db
    }

    pub fn registry(&self) -> &LeadRegistry {
        &self.registry
    }

    pub fn history(&self) -> &QualificationHistory {
        &self.history
    }

    pub fn interactions(&self) -> &InteractionLog {
        &self.log
    }

    pub fn meetings(&self) -> &MeetingManager {
        &self.meetings
    }

    pub fn scheduler(&self) -> &SlotScheduler {
        &self.scheduler
    }

    /// Resolve the lead, run text analysis over `message`, and append the
    /// resulting snapshot. Provider errors propagate untouched.
    pub async fn qualify(
        &self,
        contact: &str,
        attrs: &LeadAttributes,
        message: &str,
    ) -> Result<QualificationSnapshot> {
        let lead_id = self.registry.resolve_or_create(contact, attrs)?;
        let lead = self.registry.require_lead(&lead_id)?;

        let mut attributes = BTreeMap::new();
        attributes.insert("contact_address".to_string(), lead.contact_address.clone());
        if let Some(name) = lead.name.or_else(|| attrs.name.clone()) {
            attributes.insert("name".to_string(), name);
        }
        if let Some(company) = lead.company.or_else(|| attrs.company.clone()) {
            attributes.insert("company".to_string(), company);
        }

        let request = AnalysisRequest { attributes, message: message.to_string() };
        let raw = self.analyzer.analyze(&request).await?;
        let fields = QualificationFields::from_field_map(&raw)?;
        let snapshot = self.history.append_snapshot(&lead_id, &fields)?;
        self.log.append(
            &lead_id,
            EVENT_QUALIFIED,
            &json!({
                "priority": snapshot.priority,
                "score": snapshot.score,
                "next_action": snapshot.next_action,
            }),
        )?;
        info!("Qualified lead {} at score {}", lead_id, snapshot.score);
        Ok(snapshot)
    }

    pub async fn book(
        &self,
        lead_id: &str,
        start: DateTime<Utc>,
        duration_minutes: i64,
        meeting_type: &str,
    ) -> Result<BookingOutcome> {
        self.book_at(lead_id, start, duration_minutes, meeting_type, Utc::now()).await
    }

    /// Book, then rescore the lead when it has been qualified before.
    pub async fn book_at(
        &self,
        lead_id: &str,
        start: DateTime<Utc>,
        duration_minutes: i64,
        meeting_type: &str,
        now: DateTime<Utc>,
    ) -> Result<BookingOutcome> {
        let outcome = self
            .meetings
            .book_at(self.calendar.as_ref(), lead_id, start, duration_minutes, meeting_type, now)
            .await?;
        if self.history.has_qualification(lead_id)? {
            self.history.rescore_after_booking(lead_id, outcome.is_booked())?;
        }
        Ok(outcome)
    }

    pub async fn propose_slots(&self, preferences: &SlotPreferences, count: usize) -> Result<Vec<ProposedSlot>> {
        self.scheduler.propose_slots(preferences, count).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger_db::schema::Priority;
    use crate::providers::{InMemoryCalendar, ProviderError, StaticAnalyzer};
    use chrono::TimeZone;

    fn analyzer() -> StaticAnalyzer {
        StaticAnalyzer::new([
            ("priority", "medium"),
            ("score", "60"),
            ("reasoning", "Asked about pricing"),
            ("next_action", "Send pricing sheet"),
            ("sentiment", "positive"),
        ])
    }

    fn engine(calendar: InMemoryCalendar, analyzer: StaticAnalyzer) -> LeadEngine {
        let db = Arc::new(LeadDatabase::new_in_memory().unwrap());
        LeadEngine::new(db, SchedulerConfig::default(), Arc::new(calendar), Arc::new(analyzer)).unwrap()
    }

    #[tokio::test]
    async fn test_qualify_appends_snapshot_and_logs() {
        let analyzer = analyzer();
        let engine = engine(InMemoryCalendar::new(), analyzer.clone());
        let snapshot = engine
            .qualify("dana@corp.io", &LeadAttributes::named("Dana"), "What does it cost?")
            .await
            .unwrap();
        assert_eq!(snapshot.priority, Priority::Medium);
        assert_eq!(snapshot.sentiment.as_deref(), Some("positive"));
        assert_eq!(analyzer.calls(), 1);

        let lead = engine.registry().find_by_contact("dana@corp.io").unwrap().unwrap();
        assert_eq!(snapshot.lead_id, lead.lead_id);
        let entries = engine.interactions().history(&lead.lead_id).unwrap();
        assert_eq!(entries[0].event_type, EVENT_QUALIFIED);
        assert_eq!(entries[0].event_data["score"], 60);
    }

    #[tokio::test]
    async fn test_provider_failure_writes_no_snapshot() {
        let engine = engine(
            InMemoryCalendar::new(),
            StaticAnalyzer::failing(ProviderError::Timeout(30)),
        );
        let err = engine
            .qualify("eve@corp.io", &LeadAttributes::default(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Provider(ProviderError::Timeout(30))));
        assert_eq!(engine.database().stats().unwrap().total_qualifications, 0);
    }

    #[tokio::test]
    async fn test_incomplete_analysis_is_rejected() {
        let engine = engine(InMemoryCalendar::new(), StaticAnalyzer::new([("priority", "high")]));
        let err = engine
            .qualify("fay@corp.io", &LeadAttributes::default(), "hi")
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(engine.database().stats().unwrap().total_qualifications, 0);
    }

    #[tokio::test]
    async fn test_booking_rescores_qualified_lead() {
        let calendar = InMemoryCalendar::new();
        let engine = engine(calendar.clone(), analyzer());
        let snapshot = engine
            .qualify("gil@corp.io", &LeadAttributes::default(), "Let's talk")
            .await
            .unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();

        let booked = engine.book_at(&snapshot.lead_id, start, 30, "demo", now).await.unwrap();
        assert!(booked.is_booked());
        let latest = engine.history().latest(&snapshot.lead_id).unwrap().unwrap();
        assert_eq!(latest.score, 70);
        assert_eq!(latest.priority, Priority::High);

        let overview = engine.history().merged_with_meeting(&snapshot.lead_id).unwrap().unwrap();
        let meeting = overview.meeting.unwrap();
        assert_eq!(meeting.meeting_datetime, Some(start));

        calendar.set_always_busy(true);
        let later = start + chrono::Duration::hours(1);
        let rejected = engine.book_at(&snapshot.lead_id, later, 30, "demo", now).await.unwrap();
        assert_eq!(rejected, BookingOutcome::SlotUnavailable);
        assert_eq!(engine.history().latest(&snapshot.lead_id).unwrap().unwrap().score, 65);
        assert_eq!(engine.history().history(&snapshot.lead_id).unwrap().len(), 3);
    }
}
