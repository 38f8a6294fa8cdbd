use super::{
    overlaps, AnalysisRequest, CalendarProvider, EventRequest, FieldMap, ProviderError,
    TextAnalysisProvider,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Calendar kept entirely in memory. Busy windows can be injected, created
/// events occupy their own window, and failures can be switched on.
#[derive(Clone, Default)]
pub struct InMemoryCalendar {
    busy: Arc<DashMap<u64, (DateTime<Utc>, DateTime<Utc>)>>,
    events: Arc<DashMap<String, EventRequest>>,
    next_id: Arc<AtomicU64>,
    availability_checks: Arc<AtomicUsize>,
    always_busy: Arc<AtomicBool>,
    fail_create: Arc<AtomicBool>,
    fail_checks: Arc<AtomicBool>,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `[start, end)` as taken.
    pub fn block(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.busy.insert(id, (start, end));
    }

    /// Report every slot as taken regardless of contents.
    pub fn set_always_busy(&self, busy: bool) {
        self.always_busy.store(busy, Ordering::SeqCst);
    }

    pub fn set_create_failure(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_check_failure(&self, fail: bool) {
        self.fail_checks.store(fail, Ordering::SeqCst);
    }

    /// Created events, sorted by id.
    pub fn events(&self) -> Vec<(String, EventRequest)> {
        let mut events: Vec<_> = self
            .events
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        events.sort_by(|a, b| a.0.cmp(&b.0));
        events
    }

    pub fn availability_checks(&self) -> usize {
        self.availability_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CalendarProvider for InMemoryCalendar {
    async fn is_slot_free(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, ProviderError> {
        self.availability_checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_checks.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("calendar offline".into()));
        }
        if self.always_busy.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let blocked = self.busy.iter().any(|entry| {
            let (busy_start, busy_end) = *entry.value();
            overlaps(start, end, busy_start, busy_end)
        });
        let booked = self
            .events
            .iter()
            .any(|entry| overlaps(start, end, entry.value().start, entry.value().end));
        Ok(!blocked && !booked)
    }

    async fn create_event(&self, event: &EventRequest) -> Result<String, ProviderError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("calendar rejected write".into()));
        }
        let event_id = format!("evt_{:06}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.events.insert(event_id.clone(), event.clone());
        Ok(event_id)
    }
}

/// Analyzer that answers every request with the same fields, or the same
/// error.
#[derive(Clone)]
pub struct StaticAnalyzer {
    response: Result<FieldMap, ProviderError>,
    calls: Arc<AtomicUsize>,
}

impl StaticAnalyzer {
    pub fn new<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            response: Ok(fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        Self {
            response: Err(error),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextAnalysisProvider for StaticAnalyzer {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<FieldMap, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.clone()
    }
}
