//! cropsys - crop rotation indicator engine
//!
//! A CLI tool that stores cropping systems, aggregates their indicators and
//! uses an Ollama model to estimate the missing ones in bounded batches.
//!
//! Exit codes:
//!   0   - Success
//!   1   - Runtime error (validation, missing system, model or disk failure)
//!   130 - Batch aborted (Ctrl-C or `cropsys abort`)

mod agent;
mod analysis;
mod batch;
mod cli;
mod config;
mod error;
mod indicators;
mod models;
mod report;
mod scanner;
mod service;
mod store;

use agent::{CalculationGateway, DisabledGateway, OllamaConfig, OllamaGateway};
use anyhow::{anyhow, Context, Result};
use batch::{format_duration, BatchEvent, BatchState};
use cli::{Args, Command, OutputFormat};
use config::{Config, CONFIG_FILE};
use error::CoreError;
use indicators::IndicatorKey;
use indicatif::{ProgressBar, ProgressStyle};
use models::{format_number, System, ValueEntry};
use service::{BatchRequest, IndicatorService, SlotRequest};
use std::path::Path;
use std::sync::Arc;
use store::JsonStore;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if let Command::InitConfig = args.command {
        return handle_init_config();
    }

    // Config is loaded first so its verbose default reaches the logger
    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    // Initialize logging
    init_logging(&args, &config)?;

    info!("cropsys v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    debug!("Configuration: {:?}", config);

    match run_command(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .cropsys.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to customize the model, data directory and batch limits.");
    Ok(())
}

/// Initialize logging from the flags and the configured default.
fn init_logging(args: &Args, config: &Config) -> Result<()> {
    let level = args.log_level(config.general.verbose);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Load configuration from file or use defaults. Runs before logging is
/// set up, so problems go to stderr.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok(config),
        Ok(None) => Ok(Config::default()),
        Err(e) => {
            eprintln!("⚠️  Failed to load {}: {:#}", CONFIG_FILE, e);
            Ok(Config::default())
        }
    }
}

/// Wire stores, gateway and service from the configuration.
async fn build_service(config: &Config) -> Result<IndicatorService> {
    let store = Arc::new(
        JsonStore::open(&config.general.data_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to open data directory {}",
                    config.general.data_dir.display()
                )
            })?,
    );

    let gateway: Arc<dyn CalculationGateway> = if config.model.enabled {
        Arc::new(OllamaGateway::new(OllamaConfig {
            ollama_url: config.model.ollama_url.clone(),
            model_name: config.model.name.clone(),
            temperature: config.model.temperature,
            timeout_seconds: config.model.timeout_seconds,
            retries: config.model.retries,
        })?)
    } else {
        info!("AI calculation disabled");
        Arc::new(DisabledGateway)
    };

    Ok(IndicatorService::new(
        store.clone(),
        store,
        gateway,
        config.service_config()?,
    ))
}

/// Dispatch a subcommand. Returns the process exit code.
async fn run_command(args: Args, config: Config) -> Result<i32> {
    let service = build_service(&config).await?;
    let user = args.user.clone();

    match args.command {
        Command::InitConfig => Ok(0),
        Command::Import { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let system = service
                .import_json(&content)
                .await
                .with_context(|| format!("Failed to import {}", file.display()))?;
            println!(
                "✅ Imported '{}' ({} steps, {} interventions) as {}",
                system.name,
                system.steps.len(),
                system.intervention_count(),
                system.id
            );
            Ok(0)
        }
        Command::Recompute { system } => {
            let system = service.recompute_totals(&system).await?;
            println!("✅ Recomputed totals for {}", system.id);
            print_totals(&system);
            Ok(0)
        }
        Command::Prepare { system } => {
            let plan = service.prepare_batch(&system, &user).await?;
            println!("🔍 Batch prepared for {}", system);
            println!("   Process log: {}", plan.process_log_id);
            println!(
                "   Missing indicators: {} (~{})",
                plan.counts.without_value,
                format_duration(plan.gap_fill_seconds)
            );
            println!(
                "   Full recompute: {} (~{})",
                plan.counts.all_calculable,
                format_duration(plan.full_recompute_seconds)
            );
            println!(
                "\n   Start with: cropsys run {} --process-log {}",
                system, plan.process_log_id
            );
            Ok(0)
        }
        Command::Run {
            system,
            all,
            concurrency,
            process_log,
        } => {
            run_batch(
                &service,
                BatchRequest {
                    system_id: system,
                    process_log_id: process_log,
                    user_id: user,
                    recalculate_all: all,
                    concurrency,
                },
                args.quiet,
            )
            .await
        }
        Command::Abort { process_log } => {
            let record = service.abort_batch(&process_log).await?;
            println!(
                "⛔ Process {} is {} ({}/{} indicators)",
                record.id, record.status, record.processed_indicators, record.total_indicators
            );
            Ok(0)
        }
        Command::Compute {
            system,
            step,
            intervention,
            key,
        } => {
            let request = slot_request(system, step, intervention, &key, user)?;
            let entry = service.compute_one(request).await?;
            print_entry(&entry);
            Ok(0)
        }
        Command::Refine {
            system,
            step,
            intervention,
            key,
            message,
        } => {
            let request = slot_request(system, step, intervention, &key, user)?;
            let entry = service.refine_one(request, &message).await?;
            print_entry(&entry);
            Ok(0)
        }
        Command::Report {
            system,
            format,
            output,
        } => {
            let last_batch = service.last_batch(&system).await?;
            let system = service.system(&system).await?;
            let report = report::SystemReport::new(system, last_batch);

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
    }
}

/// Run a batch with a progress bar; Ctrl-C requests an abort.
async fn run_batch(
    service: &IndicatorService,
    mut request: BatchRequest,
    quiet: bool,
) -> Result<i32> {
    // A process log id is needed up front so Ctrl-C can flag it
    let process_log_id = match request.process_log_id.clone() {
        Some(id) => id,
        None => {
            service
                .prepare_batch(&request.system_id, &request.user_id)
                .await?
                .process_log_id
        }
    };
    request.process_log_id = Some(process_log_id.clone());

    let progress_bar = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )
                .context("Invalid progress bar template")?
                .progress_chars("#>-"),
        );
        pb
    };

    println!("🤖 Running AI batch {} on {}", process_log_id, request.system_id);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pb = progress_bar.clone();
    let renderer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                BatchEvent::Progress(p) => {
                    pb.set_length(p.total as u64);
                    pb.set_position(p.current as u64);
                    pb.set_message(format!(
                        "{} / {} / {}",
                        p.step_name, p.intervention_name, p.current_indicator
                    ));
                }
                BatchEvent::Complete(_) => pb.finish_and_clear(),
                BatchEvent::Error { message } => pb.abandon_with_message(message),
            }
        }
    });

    let mut interrupted = false;
    let result = {
        let run = service.run_batch(request, &tx);
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => break result,
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    progress_bar.println("⛔ Abort requested, waiting for in-flight calculations...");
                    if let Err(e) = service.abort_batch(&process_log_id).await {
                        warn!("Failed to abort {}: {}", process_log_id, e);
                    }
                }
            }
        }
    };
    drop(tx);
    if let Err(e) = renderer.await {
        debug!("Progress renderer stopped: {}", e);
    }

    let summary = match result {
        Ok(summary) => summary,
        Err(CoreError::Aborted(message)) => {
            println!("⛔ {}", message);
            return Ok(130);
        }
        Err(e) => return Err(e.into()),
    };
    println!("\n{}", report::generate_batch_summary(&summary));

    if summary.state == BatchState::Aborted {
        Ok(130)
    } else {
        Ok(0)
    }
}

fn slot_request(
    system_id: String,
    step_index: usize,
    intervention_index: usize,
    key: &str,
    user_id: String,
) -> Result<SlotRequest> {
    let key: IndicatorKey = key.parse().map_err(|e: String| anyhow!(e))?;
    Ok(SlotRequest {
        system_id,
        step_index,
        intervention_index,
        key,
        user_id,
    })
}

fn print_entry(entry: &ValueEntry) {
    let confidence = entry
        .confidence
        .map(|c| format!(" {} {}", c.emoji(), c))
        .unwrap_or_default();
    println!(
        "✅ {}: {} [{}]{}",
        entry.key.label(),
        format_number(entry.number()),
        entry.status,
        confidence
    );
    if let Some(reply) = entry.conversation.last() {
        println!("\n{}", reply.content);
    }
}

fn print_totals(system: &System) {
    for (key, total) in &system.system_values {
        let per_ha = system
            .system_indicators
            .per_hectare_year
            .get(key)
            .copied()
            .unwrap_or(0.0);
        println!(
            "   {}: {} ({} /ha/yr)",
            key.label(),
            format_number(*total),
            format_number(per_ha)
        );
    }
}
