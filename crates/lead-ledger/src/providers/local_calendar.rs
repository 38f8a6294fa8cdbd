use super::{CalendarProvider, EventRequest, ProviderError};
use crate::booking::MeetingManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

/// Calendar backed by the ledger's own scheduled meetings. A window is free
/// when no scheduled meeting overlaps it.
#[derive(Clone)]
pub struct LocalCalendar {
    meetings: MeetingManager,
}

impl LocalCalendar {
    pub fn new(meetings: MeetingManager) -> Self {
        Self { meetings }
    }
}

#[async_trait]
impl CalendarProvider for LocalCalendar {
    async fn is_slot_free(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, ProviderError> {
        let busy = self
            .meetings
            .scheduled_between(start, end)
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Ok(busy.is_empty())
    }

    async fn create_event(&self, event: &EventRequest) -> Result<String, ProviderError> {
        let event_id = format!("local_{}", Uuid::new_v4().simple());
        debug!("Created local event {} for {}", event_id, event.summary);
        Ok(event_id)
    }
}
