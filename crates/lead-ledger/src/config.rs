use crate::scheduler::{SchedulerConfig, ScoringWeights};
use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub timezone: Tz,
    pub business_open_hour: u32,
    pub business_close_hour: u32,
    pub default_meeting_minutes: i64,
    pub proposal_window_days: i64,
    pub max_concurrent_availability_checks: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/lead_ledger.db"),
            timezone: chrono_tz::UTC,
            business_open_hour: 9,
            business_close_hour: 17,
            default_meeting_minutes: 30,
            proposal_window_days: 14,
            max_concurrent_availability_checks: 4,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let timezone = match lookup("LEDGER_TIMEZONE") {
            Some(name) => name
                .trim()
                .parse::<Tz>()
                .map_err(|e| anyhow!("LEDGER_TIMEZONE '{}' is not a valid IANA zone: {}", name, e))?,
            None => defaults.timezone,
        };

        let config = Self {
            db_path: lookup("LEDGER_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            timezone,
            business_open_hour: parse_or(&lookup, "BUSINESS_OPEN_HOUR", defaults.business_open_hour)?,
            business_close_hour: parse_or(&lookup, "BUSINESS_CLOSE_HOUR", defaults.business_close_hour)?,
            default_meeting_minutes: parse_or(
                &lookup,
                "DEFAULT_MEETING_MINUTES",
                defaults.default_meeting_minutes,
            )?,
            proposal_window_days: parse_or(&lookup, "PROPOSAL_WINDOW_DAYS", defaults.proposal_window_days)?,
            max_concurrent_availability_checks: parse_or(
                &lookup,
                "MAX_CONCURRENT_AVAILABILITY_CHECKS",
                defaults.max_concurrent_availability_checks,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.business_open_hour >= self.business_close_hour || self.business_close_hour > 24 {
            return Err(anyhow!(
                "business hours must satisfy open < close <= 24 (got {}-{})",
                self.business_open_hour,
                self.business_close_hour
            ));
        }
        if self.default_meeting_minutes <= 0 {
            return Err(anyhow!("DEFAULT_MEETING_MINUTES must be positive"));
        }
        if self.proposal_window_days <= 0 {
            return Err(anyhow!("PROPOSAL_WINDOW_DAYS must be positive"));
        }
        if self.max_concurrent_availability_checks == 0 {
            return Err(anyhow!("MAX_CONCURRENT_AVAILABILITY_CHECKS must be at least 1"));
        }
        self.scheduler().validate()?;
        Ok(())
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            timezone: self.timezone,
            open_hour: self.business_open_hour,
            close_hour: self.business_close_hour,
            default_duration_minutes: self.default_meeting_minutes,
            proposal_window_days: self.proposal_window_days,
            max_concurrent_checks: self.max_concurrent_availability_checks,
            weights: ScoringWeights::default(),
        }
    }

    pub fn print_config(&self) {
        info!("Lead ledger configuration:");
        info!("  Database: {}", self.db_path.display());
        info!("  Time zone: {}", self.timezone);
        info!(
            "  Business hours: {:02}:00-{:02}:00, meetings {} min",
            self.business_open_hour, self.business_close_hour, self.default_meeting_minutes
        );
        info!(
            "  Proposal window: {} days, {} concurrent availability checks",
            self.proposal_window_days, self.max_concurrent_availability_checks
        );
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: '{}'", key, raw)),
        None => Ok(default),
    }
}
