use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use discipline_heat::config::EngineConfig;
use discipline_heat::db::{self, PgStore};
use discipline_heat::escalation::{EscalationEngine, LogDispatcher};
use discipline_heat::report::{self, ReportInput};
use discipline_heat::store::BehaviorStore;
use discipline_heat::{batch, scoring, service, trend};

#[derive(Parser)]
#[command(name = "discipline-heat")]
#[command(about = "Behavior heat scoring and escalation tracker", long_about = None)]
struct Cli {
    /// JSON file overriding the scoring weights
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import behavior records from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Recompute heat scores for every student
    Score {
        #[arg(long)]
        grade: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show the risk assessment for one student
    Assess {
        #[arg(long)]
        student: Uuid,
    },
    /// Evaluate escalation rules against every student
    Escalate,
    /// Dispatch escalation steps that are due
    Dispatch,
    /// Move an escalation through its workflow
    Step {
        #[arg(long)]
        id: Uuid,
        #[command(subcommand)]
        action: StepAction,
    },
    /// Compare incidents in the last period against the one before
    Trend {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        grade: Option<String>,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum StepAction {
    Approve,
    Pause,
    Resume,
    Cancel,
    Complete,
    Fail {
        #[arg(long)]
        reason: String,
    },
    Retry {
        /// RFC 3339 time for the retried step
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
}

async fn refresh_touched(
    store: &PgStore,
    touched: &BTreeSet<Uuid>,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    let now = Utc::now();
    for student_id in touched {
        service::refresh_student(store, *student_id, &config.scoring, now).await?;
    }
    Ok(())
}

async fn load_engine(store: &PgStore, config: &EngineConfig) -> anyhow::Result<EscalationEngine> {
    let rules = store.list_rules().await?;
    let mut engine = EscalationEngine::with_config(rules, config.scoring.clone());
    for disabled in engine.disabled_rules() {
        println!("Rule disabled: {}", disabled.error);
    }
    engine.load(store.load_escalations().await?);
    Ok(engine)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PgStore::new(pool);

    match cli.command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let touched = db::seed(&store).await?;
            refresh_touched(&store, &touched, &config).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let touched = db::import_csv(&store, &csv).await?;
            refresh_touched(&store, &touched, &config).await?;
            println!(
                "Imported records for {} students from {}.",
                touched.len(),
                csv.display()
            );
        }
        Commands::Score { grade, limit } => {
            let updates = service::recompute_all(&store, &config.scoring, Utc::now()).await?;
            let shown: Vec<&batch::ScoreUpdate> = updates
                .iter()
                .filter(|u| grade.as_deref().map_or(true, |g| u.grade == g))
                .collect();

            if shown.is_empty() {
                println!("No students found.");
                return Ok(());
            }

            println!("Students by heat score:");
            for update in shown.iter().take(limit) {
                println!(
                    "- {} (grade {}) heat {:.2} [{}] across {} incidents",
                    update.full_name,
                    update.grade,
                    scoring::display_score(update.score),
                    update.tier.label(),
                    update.incident_count
                );
            }
        }
        Commands::Assess { student } => {
            let profile = store.get_student(student).await?;
            let records = store.records_for(student).await?;
            let assessment = scoring::assess(&profile, &records, Utc::now(), &config.scoring);
            println!("{}", serde_json::to_string_pretty(&assessment)?);
        }
        Commands::Escalate => {
            let mut engine = load_engine(&store, &config).await?;
            let outcome = service::run_escalations(&store, &mut engine, Utc::now()).await?;
            for escalation in &outcome.created {
                println!(
                    "- {} triggered for {} ({})",
                    escalation.rule_name,
                    escalation.student_id,
                    escalation.status.as_str()
                );
            }
            for (student_id, error) in &outcome.failures {
                println!("! skipped {student_id}: {error}");
            }
            println!("{} escalations created.", outcome.created.len());
        }
        Commands::Dispatch => {
            let mut engine = load_engine(&store, &config).await?;
            let report = engine.dispatch_due(Utc::now(), &mut LogDispatcher);
            let changed: BTreeSet<Uuid> = report
                .dispatched
                .iter()
                .map(|(id, _)| *id)
                .chain(report.failed.iter().map(|(id, _, _)| *id))
                .collect();
            for id in &changed {
                if let Some(escalation) = engine.get(*id) {
                    store.save_escalation(escalation).await?;
                }
            }
            for (id, step, error) in &report.failed {
                println!("! escalation {id} step {step}: {error}");
            }
            println!(
                "{} steps dispatched, {} failed.",
                report.dispatched.len(),
                report.failed.len()
            );
        }
        Commands::Step { id, action } => {
            let mut engine = load_engine(&store, &config).await?;
            let now = Utc::now();
            let escalation = match action {
                StepAction::Approve => engine.approve(id)?,
                StepAction::Pause => engine.pause(id)?,
                StepAction::Resume => engine.resume(id)?,
                StepAction::Cancel => engine.cancel(id)?,
                StepAction::Complete => engine.complete_step(id, now)?,
                StepAction::Fail { reason } => engine.fail_step(id, &reason)?,
                StepAction::Retry { at } => engine.retry_step(id, at)?,
            };
            store.save_escalation(escalation).await?;
            println!(
                "Escalation {} is {} at step {}/{}.",
                escalation.id,
                escalation.status.as_str(),
                escalation.current_step,
                escalation.total_steps
            );
        }
        Commands::Trend { days } => {
            let now = Utc::now();
            let records = store
                .records_since(scoring::cutoff(now, days.max(1).saturating_mul(2)))
                .await?;
            let incidents = trend::incident_trend(&records, now, days);
            let merits = trend::period_trend(
                &records,
                discipline_heat::models::RecordKind::Merit,
                now,
                days,
            );
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "period_days": days.max(1),
                "incidents": incidents,
                "merits": merits,
            }))?);
        }
        Commands::Report {
            grade,
            since_days,
            out,
        } => {
            let now = Utc::now();
            let cutoff = scoring::cutoff(now, since_days);
            let updates: Vec<batch::ScoreUpdate> =
                service::recompute_all(&store, &config.scoring, now)
                    .await?
                    .into_iter()
                    .filter(|u| grade.as_deref().map_or(true, |g| u.grade == g))
                    .collect();
            let in_scope: BTreeSet<Uuid> = updates.iter().map(|u| u.student_id).collect();
            // Twice the window so the trend has a prior period to compare against.
            let records: Vec<_> = store
                .records_since(scoring::cutoff(now, since_days.max(1).saturating_mul(2)))
                .await?
                .into_iter()
                .filter(|r| in_scope.contains(&r.student_id))
                .collect();
            let escalations: Vec<_> = store
                .load_escalations()
                .await?
                .into_iter()
                .filter(|e| in_scope.contains(&e.student_id))
                .collect();
            let scope = grade.as_ref().map(|g| format!("grade {g}"));

            let report = report::build_report(&ReportInput {
                scope: scope.as_deref(),
                since_days,
                cutoff,
                now,
                updates: &updates,
                records: &records,
                escalations: &escalations,
            });
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
