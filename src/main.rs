//! Countveil: differentially private DAU/MAU over a turnstile stream.
//!
//! Main entry point: CLI subcommands for local pipeline operations and
//! the `serve` command exposing the HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use countveil::adapters::http::{router, ApiState, EnginePipeline};
use countveil::adapters::noise::ChaChaNoiseFactory;
use countveil::adapters::sanitize::SanitizingMakeWriter;
use countveil::adapters::sqlite::SqliteLedger;
use countveil::application::files::load_events;
use countveil::application::synthetic::{self, SyntheticSpec};
use countveil::{AppConfig, CountveilError, Pipeline};

/// Exit codes: 0 success, 1 usage error, 2 runtime error, 3 budget
/// exhausted.
const EXIT_USAGE: i32 = 1;
const EXIT_RUNTIME: i32 = 2;
const EXIT_BUDGET: i32 = 3;

/// Privacy-preserving distinct-user analytics
#[derive(Parser, Debug)]
#[command(name = "countveil")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP service
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8000)]
        port: u16,
    },

    /// Ingest a batch of events from a JSONL or CSV file
    Ingest {
        /// Path to the event file
        path: PathBuf,
    },

    /// Release the DP daily active user count
    Dau {
        /// Day to query (YYYY-MM-DD)
        day: NaiveDate,
    },

    /// Release the DP rolling-window active user count
    Mau {
        /// Window end day (YYYY-MM-DD)
        end: NaiveDate,

        /// Window size in days (defaults to MAU_WINDOW_DAYS)
        #[arg(long)]
        window: Option<u32>,
    },

    /// Generate a seeded synthetic workload with deletes
    GenerateSynthetic {
        /// Destination JSONL path (defaults to DATA_DIR/streams)
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[arg(short, long, default_value_t = 30)]
        days: u32,

        #[arg(short = 'n', long, default_value_t = 500)]
        daily_users: usize,

        /// Fraction of users triggering deletes per day
        #[arg(long, default_value_t = 0.1)]
        delete_rate: f64,

        #[arg(long, default_value_t = 20251009)]
        seed: u64,

        /// First generated day (default: today - days + 1)
        #[arg(long)]
        start: Option<NaiveDate>,
    },

    /// Replay pending erasures and rebuild the affected days
    FlushDeletes,

    /// Zero a month's budget for a metric (operator use)
    ResetBudget {
        /// Metric to reset (dau|mau)
        metric: String,

        /// Month in YYYY-MM format
        month: String,
    },

    /// Append a new salt epoch taking effect after the active window
    RotateSalt {
        /// Effective day for the new salt (YYYY-MM-DD)
        effective: NaiveDate,

        /// Rotation cadence in days
        #[arg(long)]
        rotation_days: Option<u32>,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = if error.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = error.print();
            std::process::exit(code);
        }
    };

    let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(SanitizingMakeWriter::new(writer)))
        .init();

    if let Err(error) = run(cli) {
        let code = match &error {
            CountveilError::Validation(_) => EXIT_USAGE,
            CountveilError::BudgetExhausted(_) => EXIT_BUDGET,
            _ => EXIT_RUNTIME,
        };
        eprintln!("error: {error}");
        if let CountveilError::BudgetExhausted(payload) = &error {
            if let Ok(details) = serde_json::to_string_pretty(&payload) {
                eprintln!("{details}");
            }
        }
        std::process::exit(code);
    }
}

fn build_pipeline(config: &AppConfig) -> Result<EnginePipeline, CountveilError> {
    let ledger_path = config.ledgers_dir().join("ledger.sqlite");
    let ledger = SqliteLedger::open(ledger_path)?;
    Pipeline::new(ledger, ChaChaNoiseFactory, config.clone())
}

fn run(cli: Cli) -> Result<(), CountveilError> {
    let config = AppConfig::from_env()?;

    match cli.command {
        Commands::Serve { host, port } => {
            let pipeline = Arc::new(build_pipeline(&config)?);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve(pipeline, &config, &host, port))
        }

        Commands::Ingest { path } => {
            let pipeline = build_pipeline(&config)?;
            let events = load_events(&path)?;
            let accepted = pipeline.ingest(&events)?;
            println!("Ingested {accepted} events from {}", path.display());
            Ok(())
        }

        Commands::Dau { day } => {
            let pipeline = build_pipeline(&config)?;
            let output = pipeline.release_dau(day)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }

        Commands::Mau { end, window } => {
            let pipeline = build_pipeline(&config)?;
            let output = pipeline.release_mau(end, window)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }

        Commands::GenerateSynthetic {
            out,
            days,
            daily_users,
            delete_rate,
            seed,
            start,
        } => {
            let out = out.unwrap_or_else(|| config.streams_dir().join("synthetic.jsonl"));
            let start = match start {
                Some(day) => day,
                None => Utc::now()
                    .date_naive()
                    .checked_sub_days(chrono::Days::new(u64::from(days.saturating_sub(1))))
                    .ok_or_else(|| {
                        CountveilError::Validation("day range underflows".to_string())
                    })?,
            };
            let spec = SyntheticSpec {
                days,
                daily_users,
                delete_rate,
                seed,
                start,
            };
            let written = synthetic::generate(&out, &spec)?;
            println!(
                "Wrote {written} events covering {days} days to {} (delete rate {delete_rate:.2}, seed {seed})",
                out.display()
            );
            Ok(())
        }

        Commands::FlushDeletes => {
            let pipeline = build_pipeline(&config)?;
            let replayed = pipeline.replay_deletions()?;
            println!("Replayed {replayed} pending erasures");
            Ok(())
        }

        Commands::ResetBudget { metric, month } => {
            let metric = metric.parse().map_err(CountveilError::Validation)?;
            let pipeline = build_pipeline(&config)?;
            pipeline.reset_budget(metric, &month)?;
            println!("Reset {} budget for {month}", metric);
            Ok(())
        }

        Commands::RotateSalt {
            effective,
            rotation_days,
        } => {
            let pipeline = build_pipeline(&config)?;
            let epoch = pipeline.rotate_salt(effective, rotation_days, None)?;
            println!("Appended salt epoch {} effective {}", epoch.id, epoch.effective_date);
            println!("Update your secrets manager:");
            println!("HASH_SALT_SECRET={}", epoch.secret);
            println!("HASH_SALT_ROTATION_DAYS={}", epoch.rotation_days);
            Ok(())
        }
    }
}

async fn serve(
    pipeline: Arc<EnginePipeline>,
    config: &AppConfig,
    host: &str,
    port: u16,
) -> Result<(), CountveilError> {
    match pipeline.backup_ledger() {
        Ok(path) => tracing::info!(path = %path.display(), "Startup ledger backup written"),
        Err(error) => tracing::warn!(error = %error, "Startup ledger backup skipped"),
    }

    let state = ApiState::new(Arc::clone(&pipeline), config.security.api_key.clone())
        .map_err(|e| CountveilError::Fatal(e.to_string()))?;
    let app = router(Arc::new(state));

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Countveil listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}
