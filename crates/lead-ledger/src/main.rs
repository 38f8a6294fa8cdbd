#[cfg(feature = "cli")]
use anyhow::{bail, Context};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use lead_ledger::{
    config::Config, telemetry, InteractionLog, LeadDatabase, LeadRegistry, LocalCalendar,
    MeetingManager, QualificationHistory, SlotScheduler,
};
#[cfg(feature = "cli")]
use serde_json::json;
#[cfg(feature = "cli")]
use std::path::PathBuf;
#[cfg(feature = "cli")]
use std::sync::Arc;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "lead-ledger", about = "Inspect the lead ledger and its meeting calendar")]
struct Cli {
    /// Database path, overriding LEDGER_DB_PATH
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Row counts and database size
    Stats,
    /// Every lead, most recently updated first
    Leads,
    /// Qualification history, merged view and timeline for a contact
    History { contact: String },
    /// Free slots on the local calendar
    Slots {
        #[arg(long, default_value_t = 7)]
        days: i64,
        #[arg(long)]
        duration: Option<i64>,
    },
    /// Scheduled meetings that never got a calendar event
    Reconcile,
    /// Delete every row
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[cfg(feature = "cli")]
fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing_with(if cli.verbose { "debug" } else { "info" });

    let mut cfg = Config::from_env()?;
    if let Some(db) = cli.db {
        cfg.db_path = db;
    }
    cfg.print_config();

    let db = Arc::new(
        LeadDatabase::new(&cfg.db_path)
            .with_context(|| format!("opening {}", cfg.db_path.display()))?,
    );
    let registry = LeadRegistry::new(db.entities.clone());
    let log = InteractionLog::new(db.entities.clone(), registry.clone());
    let history = QualificationHistory::new(db.entities.clone(), registry.clone());
    let meetings = MeetingManager::new(db.entities.clone(), registry.clone(), log.clone());

    match cli.command {
        Command::Stats => print_json(&db.stats()?)?,
        Command::Leads => print_json(&registry.all_leads()?)?,
        Command::History { contact } => {
            let Some(lead) = registry.find_by_contact(&contact)? else {
                bail!("no lead for {}", contact);
            };
            print_json(&json!({
                "lead": lead,
                "current": history.merged_with_meeting(&lead.lead_id)?,
                "qualifications": history.history(&lead.lead_id)?,
                "interactions": log.history(&lead.lead_id)?,
                "emails": log.sent_emails(Some(&lead.lead_id))?,
            }))?;
        }
        Command::Slots { days, duration } => {
            if days <= 0 {
                bail!("--days must be positive");
            }
            let scheduler_cfg = cfg.scheduler();
            let duration = duration.unwrap_or(scheduler_cfg.default_duration_minutes);
            let tz = scheduler_cfg.timezone;
            let scheduler = SlotScheduler::new(scheduler_cfg, Arc::new(LocalCalendar::new(meetings)))?;
            let now = chrono::Utc::now();
            let end = chrono::TimeDelta::try_days(days)
                .and_then(|window| now.checked_add_signed(window))
                .context("--days is out of range")?;
            let slots = scheduler.available_slots(now, end, duration).await?;
            let rendered: Vec<String> = slots
                .iter()
                .map(|s| s.with_timezone(&tz).format("%a %Y-%m-%d %H:%M %Z").to_string())
                .collect();
            print_json(&rendered)?;
        }
        Command::Reconcile => {
            let pending = meetings.unconfirmed_bookings()?;
            if pending.is_empty() {
                println!("All scheduled meetings have a calendar event.");
            } else {
                print_json(&pending)?;
            }
        }
        Command::Clear { yes } => {
            if !yes {
                bail!("refusing to clear the ledger without --yes");
            }
            db.clear_all_data()?;
            println!("Ledger cleared.");
        }
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
