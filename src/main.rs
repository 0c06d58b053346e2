use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use demo_matrix::analysis::{self, LedgerViolation, RunSummary};
use demo_matrix::behavior::PersonBehavior;
use demo_matrix::config::{MatrixConfig, ProductKind};
use demo_matrix::error::{MatrixError, error_chain};
use demo_matrix::matrix::Matrix;
use demo_matrix::output::{MatrixSink, NdjsonSink};
use demo_matrix::products::hedgebox::HedgeboxPerson;
use demo_matrix::products::pulse::PulsePerson;

const EXIT_INVARIANT: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_PERSIST: u8 = 3;
const EXIT_LEDGER: u8 = 4;

/// Simulate a population of product users and write the analytics events they produce.
#[derive(Debug, Parser)]
#[command(name = "demo-matrix", version)]
struct Cli {
    /// TOML file with a full or partial configuration; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Seed string. A fresh one is generated and printed when omitted.
    #[arg(long)]
    seed: Option<String>,
    #[arg(long)]
    clusters: Option<usize>,
    #[arg(long)]
    days_past: Option<i64>,
    #[arg(long)]
    days_future: Option<i64>,
    /// Simulated "now" as RFC 3339, e.g. 2024-01-01T00:00:00Z.
    #[arg(long)]
    now: Option<DateTime<Utc>>,
    #[arg(long, value_enum)]
    product: Option<ProductKind>,
    #[arg(long)]
    max_radius: Option<i64>,
    #[arg(long, default_value_t = 1)]
    team_id: u64,
    #[arg(long, default_value = "matrix-output")]
    output_dir: PathBuf,
    /// Simulate and verify without writing anything.
    #[arg(long)]
    dry_run: bool,
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,
    #[arg(long)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> Result<MatrixConfig, demo_matrix::error::ConfigError> {
        let mut config = match &self.config {
            Some(path) => MatrixConfig::from_file(path)?,
            None => MatrixConfig::canonical(),
        };
        if let Some(seed) = &self.seed {
            config.seed = Some(seed.clone());
        }
        if let Some(n) = self.clusters {
            config.n_clusters = n;
        }
        if let Some(d) = self.days_past {
            config.days_past = d;
        }
        if let Some(d) = self.days_future {
            config.days_future = d;
        }
        if let Some(now) = self.now {
            config.now = now;
        }
        if let Some(product) = self.product {
            config.product = product;
        }
        if self.max_radius.is_some() {
            config.max_radius = self.max_radius;
        }
        Ok(config)
    }

    fn default_filter(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.default_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match cli.config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match config.product {
        ProductKind::Hedgebox => run::<HedgeboxPerson>(&cli, &config),
        ProductKind::Pulse => run::<PulsePerson>(&cli, &config),
    }
}

fn run<B: PersonBehavior>(cli: &Cli, config: &MatrixConfig) -> ExitCode {
    let mut matrix = match Matrix::<B>::new(config) {
        Ok(matrix) => matrix,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if !cli.quiet {
        println!("Seed: {}", matrix.seed());
    }

    if let Err(e) = matrix.simulate() {
        error!("{e}");
        return match e {
            MatrixError::Config(_) => ExitCode::from(EXIT_CONFIG),
            MatrixError::Invariant { ref seed, .. } => {
                eprintln!("Simulation aborted. Reproduce with --seed {seed:?}");
                for cause in error_chain(&e).iter().skip(1) {
                    eprintln!("  caused by: {cause}");
                }
                ExitCode::from(EXIT_INVARIANT)
            }
            MatrixError::AlreadySimulated => ExitCode::from(EXIT_INVARIANT),
        };
    }

    let violations = analysis::verify_ledgers(&matrix);
    if !cli.quiet {
        print_summary(&analysis::summarize(&matrix));
        print_verification(&violations);
    }

    if cli.dry_run {
        info!("dry run, nothing written");
    } else {
        let mut sink = NdjsonSink::new(&cli.output_dir, cli.team_id);
        match sink.persist(&matrix) {
            Ok(summary) => {
                if !cli.quiet {
                    println!(
                        "\nWrote {} events, {} people, {} groups, {} snapshots → {}",
                        summary.events,
                        summary.people,
                        summary.groups,
                        summary.snapshots,
                        sink.dir().display()
                    );
                }
            }
            Err(e) => {
                error!("{e}");
                return ExitCode::from(EXIT_PERSIST);
            }
        }
    }

    if violations.is_empty() {
        ExitCode::SUCCESS
    } else {
        eprintln!("{} ledger violation(s), seed {:?}", violations.len(), matrix.seed());
        ExitCode::from(EXIT_LEDGER)
    }
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== Run summary ===");
    println!("  People:          {:>10}", summary.people);
    println!("  Active people:   {:>10}", summary.active_people);
    println!("  Sessions:        {:>10}", summary.sessions);
    println!("  Past events:     {:>10}", summary.past_events);
    println!("  Future events:   {:>10}", summary.future_events);
    println!("  Server events:   {:>10}", summary.server_events);
    println!("  Groups:          {:>10}", summary.groups);
    if let (Some(first), Some(last)) = (summary.first_event, summary.last_event) {
        println!("  First event:     {first}");
        println!("  Last event:      {last}");
    }

    if !summary.events_by_name.is_empty() {
        println!("\n  {:<28} {:>10}", "Event", "Count");
        println!("  {}", "─".repeat(39));
        for (name, count) in &summary.events_by_name {
            println!("  {name:<28} {count:>10}");
        }
    }

    if let Some(busiest) = summary.events_by_day.iter().max_by_key(|(_, count)| **count) {
        println!("\n  Days with events: {}  busiest: {} ({} events)", summary.events_by_day.len(), busiest.0, busiest.1);
    }
}

fn print_verification(violations: &[LedgerViolation]) {
    let inv = |variant: fn(&LedgerViolation) -> bool| {
        if violations.iter().any(variant) { "FAIL" } else { "PASS" }
    };

    println!("\n=== Ledger invariants ===");
    println!("  [1] Per-person chronological order:     {}", inv(|v| matches!(v, LedgerViolation::OutOfOrder { .. })));
    println!("  [2] No event before window start:       {}", inv(|v| matches!(v, LedgerViolation::BeforeStart { .. })));
    println!("  [3] Future events at or after now:      {}", inv(|v| matches!(v, LedgerViolation::FutureBeforeNow { .. })));
    println!("  [4] Every ledger split at now:          {}", inv(|v| matches!(v, LedgerViolation::NowSnapshotMissing { .. })));
    println!("  [5] Events use the person's own ids:    {}", inv(|v| matches!(v, LedgerViolation::ForeignDistinctId { .. })));
    println!("  [6] Server events attributed to people: {}", inv(|v| matches!(v, LedgerViolation::UnknownServerDistinctId { .. })));

    if violations.is_empty() {
        println!("  All ledger invariants: PASS");
    } else {
        println!("\n  {} violation(s):", violations.len());
        for v in violations {
            println!("    {v}");
        }
    }
}
