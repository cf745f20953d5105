use anyhow::{Context as _, Result, anyhow};
use clap::{Parser, Subcommand};
use mage_config::{CliOverrides, EnvConfig, Settings, load_file_config, resolve_settings};
use mage_core::{Session, SessionOptions};
use mage_heal::{HealController, HealOutcome, ThreadDelay};
use mage_store::{FailoverStore, KvStore, MemoryStore, RestStore};
use mage_synth::{
    GenerationLog, HttpSynthesisClient, RepairOutcome, RepairRequest, RepairService,
    SynthesisRequest, SynthesisService, SynthesizedFragment,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mage", version, about = "Magic-fragment synthesis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Splice cached fragments into block-compiled source and synthesize
    /// the first missing prompt.
    Run {
        file: PathBuf,
        /// Write the runnable program here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Skip all network calls; uncached markers stay in place.
        #[arg(long)]
        offline: bool,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        synth_url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        rate_limit: Option<u64>,
        #[arg(long)]
        verbose: bool,
    },
    /// Run one healing cycle against a file and print the proposed fix.
    Heal {
        file: PathBuf,
        /// The runtime error message to repair.
        #[arg(long)]
        error: String,
        #[arg(long)]
        offline: bool,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the most recent synthesized fragments from the store.
    Log {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Either the real HTTP client or an offline stand-in that fails every
/// call cleanly, which the pipeline treats as "keep the draft".
enum ServiceClient {
    Http(HttpSynthesisClient),
    Offline,
}

impl SynthesisService for ServiceClient {
    fn synthesize(&self, req: &SynthesisRequest) -> Result<SynthesizedFragment> {
        match self {
            ServiceClient::Http(client) => client.synthesize(req),
            ServiceClient::Offline => Err(anyhow!("offline mode: synthesis skipped")),
        }
    }
}

impl RepairService for ServiceClient {
    fn repair(&self, req: &RepairRequest) -> Result<RepairOutcome> {
        match self {
            ServiceClient::Http(client) => client.repair(req),
            ServiceClient::Offline => Err(anyhow!("offline mode: repair skipped")),
        }
    }
}

fn resolve(config: Option<PathBuf>, cli: CliOverrides) -> Result<Settings> {
    let cwd = std::env::current_dir()?;
    let file_cfg = load_file_config(config.as_deref(), &cwd)?;
    let env_cfg = EnvConfig::from_current_env();
    Ok(resolve_settings(&cli, &env_cfg, file_cfg.as_ref()))
}

fn build_store(settings: &Settings) -> Result<Arc<dyn KvStore>> {
    match (&settings.store_url, &settings.store_token) {
        (Some(url), Some(token)) => {
            let durable = RestStore::new(url.clone(), token.clone())?;
            Ok(Arc::new(FailoverStore::new(durable, MemoryStore::new())))
        }
        _ => Ok(Arc::new(MemoryStore::new())),
    }
}

fn build_services(settings: &Settings, offline: bool) -> Result<(ServiceClient, ServiceClient)> {
    if offline {
        return Ok((ServiceClient::Offline, ServiceClient::Offline));
    }
    let client = HttpSynthesisClient::new(
        settings.synth_url.clone(),
        settings.repair_url.clone(),
        settings.api_key.clone(),
    )?;
    Ok((
        ServiceClient::Http(client.clone()),
        ServiceClient::Http(client),
    ))
}

fn run_command(file: PathBuf, out: Option<PathBuf>, offline: bool, settings: Settings) -> Result<()> {
    let raw = fs::read_to_string(&file)
        .with_context(|| format!("failed reading source file {}", file.display()))?;

    let store = build_store(&settings)?;
    let (synthesis, repair) = build_services(&settings, offline)?;
    let heal = HealController::new(repair)
        .with_presentation_delay(Duration::from_millis(settings.presentation_delay_ms))
        .with_max_attempts(settings.heal_max_attempts);

    let mut session = Session::new(
        synthesis,
        heal,
        store,
        SessionOptions {
            cache_capacity: settings.cache_capacity,
            rate_limit: settings.rate_limit,
            rate_window_secs: settings.rate_window_secs,
            rate_identifier: "cli:generate".to_string(),
        },
    );

    let outcome = session.refresh(&raw);
    if settings.verbose {
        eprintln!(
            "[mage] refresh synthesized={:?} pending={}",
            outcome.synthesized,
            outcome.pending_prompts.len()
        );
    }
    for prompt in &outcome.pending_prompts {
        eprintln!("[mage] pending prompt: {prompt:?}");
    }
    if let Some(decision) = outcome.rate_limited {
        eprintln!(
            "[mage] generation rate limited, retry after epoch {}",
            decision.reset
        );
    }

    match out {
        Some(path) => fs::write(&path, outcome.runnable)
            .with_context(|| format!("failed writing {}", path.display()))?,
        None => print!("{}", outcome.runnable),
    }
    Ok(())
}

fn heal_command(file: PathBuf, error: String, offline: bool, settings: Settings) -> Result<()> {
    let source = fs::read_to_string(&file)
        .with_context(|| format!("failed reading source file {}", file.display()))?;

    let (_, repair) = build_services(&settings, offline)?;
    let mut heal = HealController::with_delay(repair, ThreadDelay)
        .with_presentation_delay(Duration::from_millis(settings.presentation_delay_ms))
        .with_max_attempts(settings.heal_max_attempts);

    match heal.handle(&error, &source) {
        HealOutcome::Repaired {
            fixed_code,
            explanation,
        } => {
            eprintln!("[mage] {explanation}");
            print!("{fixed_code}");
        }
        HealOutcome::Failed { reason } => {
            eprintln!("[mage] repair failed: {reason}");
        }
        HealOutcome::Exhausted { notice, .. } => {
            eprintln!("[mage] {notice}");
        }
        HealOutcome::Busy | HealOutcome::Suppressed => {
            eprintln!("[mage] healing skipped");
        }
    }
    Ok(())
}

fn log_command(settings: Settings) -> Result<()> {
    let store = build_store(&settings)?;
    let records = GenerationLog::new(store).recent()?;
    if records.is_empty() {
        eprintln!("[mage] no generation records");
        return Ok(());
    }
    for record in records {
        println!("{}\t{:?}", record.timestamp, record.prompt);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("MAGE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            out,
            offline,
            config,
            synth_url,
            api_key,
            rate_limit,
            verbose,
        } => {
            let settings = resolve(
                config,
                CliOverrides {
                    synth_url,
                    api_key,
                    rate_limit,
                    verbose: verbose.then_some(true),
                    ..CliOverrides::default()
                },
            )?;
            run_command(file, out, offline, settings)
        }
        Commands::Heal {
            file,
            error,
            offline,
            config,
        } => {
            let settings = resolve(config, CliOverrides::default())?;
            heal_command(file, error, offline, settings)
        }
        Commands::Log { config } => {
            let settings = resolve(config, CliOverrides::default())?;
            log_command(settings)
        }
    }
}
