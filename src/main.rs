//! Exposure Refiner - multi-pass exposure notification analysis
//!
//! A CLI tool that runs contact key batches through a ladder of
//! attenuation scanning passes and merges every pass into bounded,
//! converging exposure records.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error, or a pass that did not complete

mod analysis;
mod cli;
mod config;
mod models;
mod orchestrator;
mod report;
mod scanner;
mod store;

use analysis::PassLadder;
use anyhow::{Context, Result};
use cli::{Args, Command, OutputFormat};
use config::{Config, CONFIG_FILE};
use indicatif::{ProgressBar, ProgressStyle};
use models::{Batch, BatchState, KeyPackage};
use orchestrator::{AnalysisError, AnalysisOrchestrator, PassOutcome};
use report::Report;
use scanner::ReplayScanner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::BatchStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // No logging needed to write the config template
    if args.command == Command::InitConfig {
        return handle_init_config();
    }

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(&args, &config);

    info!("Exposure Refiner v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .exposure-refiner.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to customize the pass ladder, weights, and store location.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args, config: &Config) {
    let level = match args.log_level() {
        tracing::Level::INFO if config.general.verbose => tracing::Level::DEBUG,
        level => level,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Dispatch a subcommand. Returns the exit code.
async fn run(args: Args, config: Config) -> Result<i32> {
    let ladder = config
        .analysis
        .ladder()
        .context("Invalid pass ladder in configuration")?;
    debug!("Pass ladder: {:?}", ladder.passes());

    let store = Arc::new(BatchStore::open(&config.general.store).with_context(|| {
        format!(
            "Failed to open batch store {}",
            config.general.store.display()
        )
    })?);

    match args.command {
        Command::Import { file } => handle_import(&store, &file),
        Command::Analyze { user, rounds } => {
            handle_analyze(&config, store, ladder, user, rounds, args.quiet).await
        }
        Command::Status => handle_status(&store, &ladder),
        Command::Report { format, output } => handle_report(&store, &ladder, format, output),
        Command::Clear { .. } => handle_clear(&store),
        Command::InitConfig => {
            handle_init_config()?;
            Ok(0)
        }
    }
}

/// Import a key package into the store.
fn handle_import(store: &BatchStore, file: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read key package {}", file.display()))?;
    let package: KeyPackage = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse key package {}", file.display()))?;

    let user_name = package.user_name.clone();
    let key_count = package.keys.len();
    let risk_level = store
        .import(package)
        .with_context(|| format!("Failed to import keys for {}", user_name))?;
    store.save().context("Failed to save batch store")?;

    println!(
        "📥 Imported {} keys for {} (transmission risk level {})",
        key_count, user_name, risk_level
    );
    Ok(0)
}

/// Run refinement passes against the replay collaborator.
async fn handle_analyze(
    config: &Config,
    store: Arc<BatchStore>,
    ladder: PassLadder,
    user: Option<String>,
    rounds: Option<usize>,
    quiet: bool,
) -> Result<i32> {
    let start_time = Instant::now();

    let scanner = ReplayScanner::load(&config.scanner.replay).with_context(|| {
        format!(
            "Failed to load recorded measurements from {}",
            config.scanner.replay.display()
        )
    })?;

    let orchestrator = AnalysisOrchestrator::new(Arc::new(scanner), Arc::clone(&store), ladder)
        .with_pass_timeout(config.analysis.pass_timeout());

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight passes");
            interrupt.cancel();
        }
    });

    println!(
        "🔬 Running {}-pass refinement ladder...",
        Batch::required_passes(orchestrator.ladder().len())
    );
    let spinner = create_spinner(quiet);

    let mut failures = 0;
    match user {
        Some(user) => {
            if let Some(pb) = &spinner {
                pb.set_message(format!("Refining {}", user));
            }
            match analyze_user(&orchestrator, &user, rounds, &cancel).await {
                Ok(state) => info!("{} is now {}", user, state),
                Err(e) => {
                    failures += 1;
                    eprintln!("⚠️  {}: {}", user, e);
                }
            }
        }
        None => {
            if let Some(pb) = &spinner {
                pb.set_message("Refining all batches");
            }
            for round in orchestrator.analyze_all(&cancel, rounds).await {
                let Some(pass) = round.pass else {
                    continue;
                };
                println!(
                    "   Pass {}: {} of {} batches advanced",
                    pass,
                    round.advanced(),
                    round.results.len()
                );
                for (user, result) in &round.results {
                    if let Err(e) = result {
                        failures += 1;
                        eprintln!("⚠️  {}: {}", user, e);
                    }
                }
            }
        }
    }

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let anomalies = orchestrator.anomalies();
    if !anomalies.is_empty() && !quiet {
        println!("\n🔎 Anomalies:");
        for entry in anomalies.entries() {
            println!(
                "   {} {} pass {} {}: {}",
                entry.user_name,
                entry.event.fingerprint,
                entry.event.pass,
                entry.event.field,
                entry.event.anomaly
            );
        }
    }

    let report = Report::build(&store.snapshot(), orchestrator.ladder(), None);
    println!("\n📊 Analysis Summary:");
    print!("{}", report::generate_status_table(&report.batches));
    println!("   Anomalies: {}", anomalies.len());
    println!("   Duration: {:.1}s", start_time.elapsed().as_secs_f64());

    if cancel.is_cancelled() {
        eprintln!("\n⛔ Analysis interrupted; batches keep their last completed pass.");
        return Ok(1);
    }
    if failures > 0 {
        eprintln!("\n⛔ {} passes did not complete.", failures);
        return Ok(1);
    }

    println!("\n✅ Analysis complete!");
    Ok(0)
}

/// Advance one batch, either to completion or by at most `rounds` passes.
async fn analyze_user(
    orchestrator: &AnalysisOrchestrator<ReplayScanner>,
    user: &str,
    rounds: Option<usize>,
    cancel: &CancellationToken,
) -> Result<BatchState, AnalysisError> {
    let Some(limit) = rounds else {
        return orchestrator.run_to_completion(user, cancel).await;
    };

    for _ in 0..limit {
        match orchestrator.run_next_pass(user, cancel).await? {
            PassOutcome::Advanced { pass, report } => {
                println!(
                    "   Pass {}: {} created, {} refined",
                    pass, report.created, report.refined
                );
            }
            PassOutcome::Complete => break,
        }
    }
    Ok(orchestrator.state(user).unwrap_or(BatchState::Complete))
}

fn create_spinner(quiet: bool) -> Option<ProgressBar> {
    if quiet {
        return None;
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    Some(pb)
}

/// Print where every batch stands on the ladder.
fn handle_status(store: &BatchStore, ladder: &PassLadder) -> Result<i32> {
    let batches = store.snapshot();
    if batches.is_empty() {
        println!("No batches imported.");
        return Ok(0);
    }

    let report = Report::build(&batches, ladder, None);
    print!("{}", report::generate_status_table(&report.batches));
    Ok(0)
}

/// Write a Markdown or JSON report of every batch.
fn handle_report(
    store: &BatchStore,
    ladder: &PassLadder,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> Result<i32> {
    let report = Report::build(
        &store.snapshot(),
        ladder,
        store.path().map(Path::to_path_buf),
    );

    let content = match format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };

    match output {
        Some(path) => {
            std::fs::write(&path, &content)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            println!("✅ Report saved to: {}", path.display());
        }
        None => print!("{}", content),
    }
    Ok(0)
}

/// Delete every batch.
fn handle_clear(store: &BatchStore) -> Result<i32> {
    let count = store.clear().context("Failed to clear batch store")?;
    store.save().context("Failed to save batch store")?;

    println!("🗑️  Deleted {} batches.", count);
    Ok(0)
}

/// Load configuration from file or use defaults.
///
/// Runs before logging is set up, so problems go straight to stderr.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => Ok(config),
        Ok(None) => Ok(Config::default()),
        Err(e) => {
            eprintln!("⚠️  Ignoring {}: {:#}", CONFIG_FILE, e);
            Ok(Config::default())
        }
    }
}
