pub mod booking;
pub mod config;
pub mod engine;
pub mod error;
pub mod interactions;
pub mod ledger_db;
pub mod providers;
pub mod qualification;
pub mod registry;
pub mod scheduler;
pub mod telemetry;

// Public API exports
pub use booking::{BookingOutcome, CalendarEventFields, MeetingFields, MeetingManager};
pub use config::Config;
pub use engine::LeadEngine;
pub use error::{LedgerError, Result, StorageError};
pub use interactions::{InteractionLog, OutgoingEmail};
pub use ledger_db::{
    CalendarEvent, DatabaseStats, Interaction, Lead, LeadDatabase, Meeting, MeetingStatus, Priority,
    QualificationSnapshot, SentEmail,
};
pub use providers::{
    CalendarProvider, InMemoryCalendar, LocalCalendar, ProviderError, StaticAnalyzer,
    TextAnalysisProvider,
};
pub use qualification::{LeadOverview, QualificationFields, QualificationHistory};
pub use registry::{LeadAttributes, LeadRegistry};
pub use scheduler::{ProposedSlot, SchedulerConfig, SlotPreferences, SlotScheduler, Urgency};
