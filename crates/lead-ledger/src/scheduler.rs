//! Business-hours slot computation, availability filtering and
//! preference-based ranking.
//!
//! All wall-clock reasoning happens in the single time zone the scheduler
//! is configured with. Slots are half-open `[start, start + duration)`.
use crate::error::{LedgerError, Result};
use crate::ledger_db::schema::add_minutes;
use crate::providers::{CalendarProvider, ProviderError};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt, TryStreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

const MAX_PROPOSAL_WINDOW_DAYS: i64 = 366;

lazy_static! {
    static ref TIME_RANGE: Regex =
        Regex::new(r"^\s*(\d{1,2}):(\d{2})\s*-\s*(\d{1,2}):(\d{2})\s*$").expect("valid time range pattern");
}

/// Points awarded per matching preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub preferred_day: i64,
    pub time_range: i64,
    pub morning: i64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self { preferred_day: 20, time_range: 15, morning: 10 }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub timezone: Tz,
    pub open_hour: u32,
    pub close_hour: u32,
    pub default_duration_minutes: i64,
    pub proposal_window_days: i64,
    pub max_concurrent_checks: usize,
    pub weights: ScoringWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            open_hour: 9,
            close_hour: 17,
            default_duration_minutes: 30,
            proposal_window_days: 14,
            max_concurrent_checks: 4,
            weights: ScoringWeights::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.open_hour >= self.close_hour || self.close_hour > 24 {
            return Err(LedgerError::validation(format!(
                "business hours must satisfy open < close <= 24, got {}-{}",
                self.open_hour, self.close_hour
            )));
        }
        if self.default_duration_minutes <= 0 {
            return Err(LedgerError::validation("default meeting duration must be positive"));
        }
        if !(1..=MAX_PROPOSAL_WINDOW_DAYS).contains(&self.proposal_window_days) {
            return Err(LedgerError::validation(format!(
                "proposal window must be between 1 and {} days, got {}",
                MAX_PROPOSAL_WINDOW_DAYS, self.proposal_window_days
            )));
        }
        if self.default_duration_minutes > i64::from(self.close_hour - self.open_hour) * 60 {
            return Err(LedgerError::validation(format!(
                "default meeting duration {} does not fit in business hours",
                self.default_duration_minutes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    High,
    Medium,
    Low,
}

impl Urgency {
    /// Days ahead to search; `Low` uses the configured window.
    pub fn window_days(&self, configured: i64) -> i64 {
        match self {
            Urgency::High => 3,
            Urgency::Medium => 7,
            Urgency::Low => configured,
        }
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Urgency::High),
            "medium" => Ok(Urgency::Medium),
            "low" => Ok(Urgency::Low),
            other => Err(format!("unknown urgency '{}'", other)),
        }
    }
}

/// A parsed "HH:MM-HH:MM" window, start inclusive, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    /// `None` for anything malformed, including empty or inverted ranges.
    pub fn parse(raw: &str) -> Option<Self> {
        let caps = TIME_RANGE.captures(raw)?;
        let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
        let start = NaiveTime::from_hms_opt(field(1)?, field(2)?, 0)?;
        let end = NaiveTime::from_hms_opt(field(3)?, field(4)?, 0)?;
        (start < end).then_some(TimeRange { start, end })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time < self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotPreferences {
    pub preferred_days: Vec<Weekday>,
    pub preferred_time_ranges: Vec<String>,
    pub urgency: Option<Urgency>,
}

impl SlotPreferences {
    /// Build preferences from untyped JSON. Absent or null keys are unset;
    /// anything else of the wrong shape is rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| LedgerError::InvalidPreferences("preferences must be an object".into()))?;

        let strings = |key: &str| -> Result<Vec<String>> {
            match obj.get(key) {
                None | Some(serde_json::Value::Null) => Ok(Vec::new()),
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| {
                            LedgerError::InvalidPreferences(format!("{} must contain only strings", key))
                        })
                    })
                    .collect(),
                Some(_) => Err(LedgerError::InvalidPreferences(format!("{} must be a list", key))),
            }
        };

        let preferred_days = strings("preferred_days")?
            .iter()
            .map(|name| {
                name.trim()
                    .parse::<Weekday>()
                    .map_err(|_| LedgerError::InvalidPreferences(format!("unknown weekday '{}'", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        let urgency = match obj.get("urgency") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => {
                Some(s.parse::<Urgency>().map_err(LedgerError::InvalidPreferences)?)
            }
            Some(_) => return Err(LedgerError::InvalidPreferences("urgency must be a string".into())),
        };

        Ok(Self {
            preferred_days,
            preferred_time_ranges: strings("preferred_time_ranges")?,
            urgency,
        })
    }
}

/// A ranked candidate slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProposedSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub weekday: String,
    pub local_time: String,
    pub score: i64,
}

pub struct SlotScheduler {
    config: SchedulerConfig,
    calendar: Arc<dyn CalendarProvider>,
}

impl SlotScheduler {
    pub fn new(config: SchedulerConfig, calendar: Arc<dyn CalendarProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, calendar })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Weekday, at or after opening, and finished by closing, all in local time.
    pub fn is_business_hours(&self, start: DateTime<Utc>, duration_minutes: i64) -> bool {
        if duration_minutes <= 0 {
            return false;
        }
        let local = start.with_timezone(&self.config.timezone);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let minute_of_day = i64::from(local.hour() * 60 + local.minute());
        local.hour() >= self.config.open_hour
            && minute_of_day
                .checked_add(duration_minutes)
                .is_some_and(|end| end <= i64::from(self.config.close_hour) * 60)
    }

    fn local_instant(&self, date: NaiveDate, minute_of_day: i64) -> Option<DateTime<Utc>> {
        let time = NaiveTime::from_hms_opt((minute_of_day / 60) as u32, (minute_of_day % 60) as u32, 0)?;
        match self.config.timezone.from_local_datetime(&date.and_time(time)).earliest() {
            Some(local) => Some(local.with_timezone(&Utc)),
            None => {
                debug!("Skipping nonexistent local time {} {} in {}", date, time, self.config.timezone);
                None
            }
        }
    }

    /// Every aligned business-hours start in `[start_date, end_date)` that
    /// is not before `now`, without consulting the calendar.
    fn candidate_starts(
        &self,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        duration_minutes: i64,
        now: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let tz = self.config.timezone;
        let open = i64::from(self.config.open_hour) * 60;
        let close = i64::from(self.config.close_hour) * 60;
        let last_day = end_date.with_timezone(&tz).date_naive();

        let mut candidates = Vec::new();
        let mut day = start_date.with_timezone(&tz).date_naive();
        while day <= last_day {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                let mut minute = open;
                while minute.checked_add(duration_minutes).is_some_and(|end| end <= close) {
                    if let Some(slot) = self.local_instant(day, minute) {
                        if slot >= start_date
                            && add_minutes(slot, duration_minutes).is_some_and(|end| end <= end_date)
                            && slot >= now
                            && self.is_business_hours(slot, duration_minutes)
                        {
                            candidates.push(slot);
                        }
                    }
                    minute += duration_minutes;
                }
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        candidates
    }

    pub async fn available_slots(
        &self,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        duration_minutes: i64,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.available_slots_at(start_date, end_date, duration_minutes, Utc::now())
            .await
    }

    /// Free business-hours slots in `[start_date, end_date)`, ascending.
    pub async fn available_slots_at(
        &self,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        duration_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        if start_date >= end_date {
            return Err(LedgerError::InvalidRange(format!(
                "start {} is not before end {}",
                start_date, end_date
            )));
        }
        if duration_minutes <= 0 {
            return Err(LedgerError::InvalidRange(format!(
                "duration must be positive, got {}",
                duration_minutes
            )));
        }

        let duration = Duration::try_minutes(duration_minutes).ok_or_else(|| {
            LedgerError::InvalidRange(format!("duration {} minutes is out of range", duration_minutes))
        })?;
        let candidates = self.candidate_starts(start_date, end_date, duration_minutes, now);
        let calendar = &self.calendar;
        let checked: Vec<(DateTime<Utc>, bool)> = stream::iter(candidates)
            .map(|slot| async move {
                let free = calendar.is_slot_free(slot, slot + duration).await?;
                Ok::<_, ProviderError>((slot, free))
            })
            .buffered(self.config.max_concurrent_checks.max(1))
            .try_collect()
            .await?;

        let total = checked.len();
        let free: Vec<DateTime<Utc>> = checked
            .into_iter()
            .filter_map(|(slot, free)| free.then_some(slot))
            .collect();
        debug!("{} of {} candidate slots are free", free.len(), total);
        Ok(free)
    }

    pub async fn propose_slots(&self, preferences: &SlotPreferences, count: usize) -> Result<Vec<ProposedSlot>> {
        self.propose_slots_at(preferences, count, Utc::now()).await
    }

    /// Untyped entry point: `preferences` must be a JSON object.
    pub async fn propose_slots_json(
        &self,
        preferences: &serde_json::Value,
        count: usize,
    ) -> Result<Vec<ProposedSlot>> {
        let preferences = SlotPreferences::from_json(preferences)?;
        self.propose_slots(&preferences, count).await
    }

    /// Rank free slots in the urgency window by preference score, highest
    /// first, earliest first among equal scores.
    pub async fn propose_slots_at(
        &self,
        preferences: &SlotPreferences,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProposedSlot>> {
        if count == 0 {
            return Err(LedgerError::InvalidPreferences("count must be positive".into()));
        }
        let window_days = preferences
            .urgency
            .map(|u| u.window_days(self.config.proposal_window_days))
            .unwrap_or(self.config.proposal_window_days);
        let duration_minutes = self.config.default_duration_minutes;
        let duration = Duration::minutes(duration_minutes);
        let pool = self
            .available_slots_at(now, now + Duration::days(window_days), duration_minutes, now)
            .await?;

        let ranges: Vec<TimeRange> = preferences
            .preferred_time_ranges
            .iter()
            .filter_map(|raw| TimeRange::parse(raw))
            .collect();

        let mut proposals: Vec<ProposedSlot> = pool
            .into_iter()
            .map(|start| {
                let local = start.with_timezone(&self.config.timezone);
                ProposedSlot {
                    start,
                    end: start + duration,
                    weekday: local.format("%A").to_string(),
                    local_time: local.format("%A, %B %d at %I:%M %p").to_string(),
                    score: self.score(&local, preferences, &ranges),
                }
            })
            .collect();
        proposals.sort_by(|a, b| b.score.cmp(&a.score).then(a.start.cmp(&b.start)));
        proposals.truncate(count);

        info!("Proposing {} slots over a {} day window", proposals.len(), window_days);
        Ok(proposals)
    }

    fn score(&self, local: &DateTime<Tz>, preferences: &SlotPreferences, ranges: &[TimeRange]) -> i64 {
        let weights = self.config.weights;
        let mut score = 0;
        if preferences.preferred_days.contains(&local.weekday()) {
            score += weights.preferred_day;
        }
        let time = NaiveTime::from_hms_opt(local.hour(), local.minute(), 0).unwrap_or(NaiveTime::MIN);
        score += weights.time_range * ranges.iter().filter(|r| r.contains(time)).count() as i64;
        if ranges.is_empty() && local.hour() < 12 {
            score += weights.morning;
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InMemoryCalendar;
    use serde_json::json;

    fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    // 2026-03-02 is a Monday.
    fn sunday_night() -> DateTime<Utc> {
        utc(1, 23, 0)
    }

    fn scheduler(calendar: &InMemoryCalendar) -> SlotScheduler {
        SlotScheduler::new(SchedulerConfig::default(), Arc::new(calendar.clone())).unwrap()
    }

    #[test]
    fn test_business_hours_predicate() {
        let s = scheduler(&InMemoryCalendar::new());
        assert!(s.is_business_hours(utc(2, 9, 0), 30));
        assert!(s.is_business_hours(utc(2, 16, 30), 30));
        assert!(!s.is_business_hours(utc(2, 16, 45), 30));
        assert!(!s.is_business_hours(utc(2, 8, 30), 30));
        assert!(!s.is_business_hours(utc(7, 10, 0), 30));
        assert!(!s.is_business_hours(utc(2, 10, 0), 0));
    }

    #[tokio::test]
    async fn test_saturday_has_no_slots() {
        let calendar = InMemoryCalendar::new();
        let s = scheduler(&calendar);
        let slots = s.available_slots_at(utc(7, 0, 0), utc(8, 0, 0), 30, sunday_night()).await.unwrap();
        assert!(slots.is_empty());
        assert_eq!(calendar.availability_checks(), 0);
    }

    #[tokio::test]
    async fn test_full_weekday_minus_busy_window() {
        let calendar = InMemoryCalendar::new();
        calendar.block(utc(2, 10, 0), utc(2, 11, 0));
        let s = scheduler(&calendar);
        let slots = s.available_slots_at(utc(2, 0, 0), utc(3, 0, 0), 30, sunday_night()).await.unwrap();
        assert_eq!(slots.len(), 14);
        assert_eq!(slots[0], utc(2, 9, 0));
        assert_eq!(*slots.last().unwrap(), utc(2, 16, 30));
        assert!(!slots.contains(&utc(2, 10, 0)));
        assert!(!slots.contains(&utc(2, 10, 30)));
        assert!(slots.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_past_slots_and_range_bounds_are_excluded() {
        let s = scheduler(&InMemoryCalendar::new());
        let slots = s.available_slots_at(utc(2, 0, 0), utc(2, 13, 0), 60, utc(2, 10, 15)).await.unwrap();
        assert_eq!(slots, vec![utc(2, 11, 0), utc(2, 12, 0)]);
    }

    #[tokio::test]
    async fn test_invalid_range() {
        let s = scheduler(&InMemoryCalendar::new());
        let inverted = s.available_slots_at(utc(3, 0, 0), utc(2, 0, 0), 30, sunday_night()).await;
        assert!(matches!(inverted.unwrap_err(), LedgerError::InvalidRange(_)));
        let zero = s.available_slots_at(utc(2, 0, 0), utc(3, 0, 0), 0, sunday_night()).await;
        assert!(matches!(zero.unwrap_err(), LedgerError::InvalidRange(_)));
    }

    #[tokio::test]
    async fn test_oversized_durations() {
        let calendar = InMemoryCalendar::new();
        let s = scheduler(&calendar);
        let unrepresentable = s.available_slots_at(utc(2, 0, 0), utc(3, 0, 0), i64::MAX, sunday_night()).await;
        assert!(matches!(unrepresentable.unwrap_err(), LedgerError::InvalidRange(_)));

        let longer_than_a_day = s
            .available_slots_at(utc(2, 0, 0), utc(3, 0, 0), 1_000_000_000_000, sunday_night())
            .await
            .unwrap();
        assert!(longer_than_a_day.is_empty());
        assert_eq!(calendar.availability_checks(), 0);

        assert!(!s.is_business_hours(utc(2, 9, 0), i64::MAX));
    }

    #[tokio::test]
    async fn test_provider_errors_propagate() {
        let calendar = InMemoryCalendar::new();
        calendar.set_check_failure(true);
        let err = scheduler(&calendar)
            .available_slots_at(utc(2, 0, 0), utc(3, 0, 0), 30, sunday_night())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_local_timezone_shifts_business_hours() {
        let config = SchedulerConfig { timezone: chrono_tz::America::New_York, ..Default::default() };
        let s = SlotScheduler::new(config, Arc::new(InMemoryCalendar::new())).unwrap();
        let slots = s.available_slots_at(utc(2, 0, 0), utc(3, 0, 0), 60, sunday_night()).await.unwrap();
        // EST is UTC-5 before the March switch.
        assert_eq!(slots.first(), Some(&utc(2, 14, 0)));
        assert_eq!(slots.last(), Some(&utc(2, 21, 0)));
    }

    #[tokio::test]
    async fn test_preferences_rank_slots() {
        let s = scheduler(&InMemoryCalendar::new());
        let prefs = SlotPreferences {
            preferred_days: vec![Weekday::Tue],
            preferred_time_ranges: vec!["14:00-15:00".into(), "garbage".into()],
            urgency: Some(Urgency::Medium),
        };
        let proposals = s.propose_slots_at(&prefs, 3, sunday_night()).await.unwrap();
        assert_eq!(proposals.len(), 3);
        assert_eq!(proposals[0].start, utc(3, 14, 0));
        assert_eq!(proposals[0].score, 35);
        assert_eq!(proposals[0].weekday, "Tuesday");
        assert_eq!(proposals[1].start, utc(3, 14, 30));
        // Any Tuesday slot outranks a range match on another day.
        assert_eq!(proposals[2].score, 20);
        assert_eq!(proposals[2].start, utc(3, 9, 0));
    }

    #[tokio::test]
    async fn test_morning_bonus_without_time_ranges() {
        let s = scheduler(&InMemoryCalendar::new());
        let proposals = s
            .propose_slots_at(&SlotPreferences::default(), 2, sunday_night())
            .await
            .unwrap();
        assert_eq!(proposals[0].start, utc(2, 9, 0));
        assert_eq!(proposals[0].score, 10);
        assert_eq!(proposals[0].local_time, "Monday, March 02 at 09:00 AM");
    }

    #[tokio::test]
    async fn test_high_urgency_narrows_window() {
        let s = scheduler(&InMemoryCalendar::new());
        let prefs = SlotPreferences { urgency: Some(Urgency::High), ..Default::default() };
        let proposals = s.propose_slots_at(&prefs, 500, sunday_night()).await.unwrap();
        let horizon = sunday_night() + Duration::days(3);
        assert!(proposals.iter().all(|p| p.end <= horizon));
        assert_eq!(proposals.len(), 16 * 3);
    }

    #[tokio::test]
    async fn test_ranking_is_deterministic() {
        let calendar = InMemoryCalendar::new();
        calendar.block(utc(3, 9, 0), utc(3, 12, 0));
        let s = scheduler(&calendar);
        let prefs = SlotPreferences {
            preferred_days: vec![Weekday::Wed, Weekday::Tue],
            preferred_time_ranges: vec!["09:00-12:00".into()],
            urgency: None,
        };
        let first = s.propose_slots_at(&prefs, 10, sunday_night()).await.unwrap();
        let second = s.propose_slots_at(&prefs, 10, sunday_night()).await.unwrap();
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_zero_count_is_rejected() {
        let s = scheduler(&InMemoryCalendar::new());
        let err = s.propose_slots_at(&SlotPreferences::default(), 0, sunday_night()).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidPreferences(_)));
    }

    #[test]
    fn test_time_range_parsing() {
        let range = TimeRange::parse(" 9:30 - 11:00 ").unwrap();
        assert!(range.contains(NaiveTime::from_hms_opt(9, 30, 0).unwrap()));
        assert!(!range.contains(NaiveTime::from_hms_opt(11, 0, 0).unwrap()));
        assert!(TimeRange::parse("11:00-09:00").is_none());
        assert!(TimeRange::parse("25:00-26:00").is_none());
        assert!(TimeRange::parse("afternoon").is_none());
    }

    #[test]
    fn test_preferences_from_json() {
        let prefs = SlotPreferences::from_json(&json!({
            "preferred_days": ["Monday", "fri"],
            "preferred_time_ranges": ["10:00-12:00"],
            "urgency": "high",
            "ignored": true
        }))
        .unwrap();
        assert_eq!(prefs.preferred_days, vec![Weekday::Mon, Weekday::Fri]);
        assert_eq!(prefs.urgency, Some(Urgency::High));

        for bad in [
            json!(["monday"]),
            json!({"preferred_days": "monday"}),
            json!({"preferred_days": ["funday"]}),
            json!({"preferred_time_ranges": [9]}),
            json!({"urgency": 3}),
            json!({"urgency": "asap"}),
        ] {
            let err = SlotPreferences::from_json(&bad).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidPreferences(_)), "{}", bad);
        }
        assert_eq!(SlotPreferences::from_json(&json!({"urgency": null})).unwrap(), SlotPreferences::default());
    }

    #[test]
    fn test_config_validation() {
        let bad = SchedulerConfig { open_hour: 17, close_hour: 9, ..Default::default() };
        assert!(SlotScheduler::new(bad, Arc::new(InMemoryCalendar::new())).is_err());
        let endless = SchedulerConfig { proposal_window_days: i64::MAX, ..Default::default() };
        assert!(SlotScheduler::new(endless, Arc::new(InMemoryCalendar::new())).is_err());
        let too_long = SchedulerConfig { default_duration_minutes: 9 * 60, ..Default::default() };
        assert!(SlotScheduler::new(too_long, Arc::new(InMemoryCalendar::new())).is_err());
    }
}
