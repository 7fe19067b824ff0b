//! FireFlow - firewall policy compiler
//!
//! Validates, analyzes, compiles and applies filtering policies written as
//! JSON documents.
//!
//! # Usage
//!
//! ```bash
//! fireflow check web.json                         # Validation + conflict report
//! fireflow compile web.json --format nft          # Render as nftables text
//! fireflow compile web.json --format json         # Render as nftables JSON
//! fireflow diff old.json new.json                 # Diff the rendered rulesets
//! fireflow apply web.json --firewall edge-1       # Compile and apply via the target
//! fireflow apply web.json --firewall edge-1 --dry-run
//! fireflow status edge-1                          # Firewall state and last task
//! fireflow export edge-1 web -o web.json          # Write a stored policy back out
//! fireflow init                                   # Write a default config file
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`, falling back to
//! `log_level` from the config file.

use clap::{Parser, Subcommand, ValueEnum};
use fireflow::audit::Auditor;
use fireflow::config::{self, AppConfig};
use fireflow::core::analyze::Severity;
use fireflow::core::compile::{check_policy, compile};
use fireflow::core::document::{PolicyDocument, load_document, save_document};
use fireflow::core::error::TargetErrorPattern;
use fireflow::core::model::{Environment, FilteringPolicy, Principal};
use fireflow::core::render::{diff_nft, instructions_summary};
use fireflow::engine::Engine;
use fireflow::orchestrator::target::{ApplyTarget, CommandTarget, DryRunTarget};
use fireflow::orchestrator::task::TaskState;
use fireflow::store::{JsonFileStore, Store};
use fireflow::utils::truncate_string;
use fireflow::validators::{check_reserved_ip, check_well_known_port};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "fireflow")]
#[command(version, about = "FireFlow - firewall policy compiler and application pipeline", long_about = None)]
struct Cli {
    /// Config file (default: config.json in the data directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a policy document and report conflicts
    Check {
        policy: PathBuf,
    },
    /// Compile a policy document and print the result
    Compile {
        policy: PathBuf,
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Show how the compiled ruleset changes between two documents
    Diff {
        old: PathBuf,
        new: PathBuf,
    },
    /// Compile a document and apply it to a firewall
    Apply {
        policy: PathBuf,
        /// Firewall name; created on first use
        #[arg(long)]
        firewall: String,
        /// Environment for a newly created firewall
        #[arg(long, default_value = "development")]
        environment: String,
        /// Log the instructions instead of running the target program
        #[arg(long)]
        dry_run: bool,
        /// Store file (default: from config, else store.json in the data directory)
        #[arg(long, value_name = "FILE")]
        store: Option<PathBuf>,
        /// Identity recorded in the audit log
        #[arg(long, default_value = "cli")]
        principal: String,
    },
    /// Show a firewall's state and its latest task
    Status {
        firewall: String,
        #[arg(long, value_name = "FILE")]
        store: Option<PathBuf>,
    },
    /// Write a stored policy out as a document
    Export {
        firewall: String,
        policy: String,
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
        #[arg(long, value_name = "FILE")]
        store: Option<PathBuf>,
    },
    /// Write the current (or default) config to the config file
    Init,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    /// nftables JSON
    Json,
    /// nftables text
    Nft,
    /// One line per instruction
    Text,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<ExitCode> {
    let config = match &cli.config {
        Some(path) => config::load_config_from(path).await,
        None => config::load_config().await,
    };
    init_logging(&config.log_level);

    match cli.command {
        Commands::Check { policy } => check(&policy).await,
        Commands::Compile { policy, format } => compile_document(&policy, format).await,
        Commands::Diff { old, new } => diff(&old, &new).await,
        Commands::Apply {
            policy,
            firewall,
            environment,
            dry_run,
            store,
            principal,
        } => {
            let environment = Environment::from_str(&environment)
                .map_err(|_| format!("unknown environment '{environment}'"))?;
            let request = ApplyRequest {
                policy,
                firewall,
                environment,
                principal: Principal::new(principal),
            };
            let store = open_store(store.as_deref(), &config)?;
            if dry_run {
                apply(request, store, DryRunTarget, config).await
            } else {
                let target = CommandTarget::from_config(&config.target);
                apply(request, store, target, config).await
            }
        }
        Commands::Status { firewall, store } => status(&firewall, open_store(store.as_deref(), &config)?),
        Commands::Export {
            firewall,
            policy,
            output,
            store,
        } => export(&firewall, &policy, &output, open_store(store.as_deref(), &config)?).await,
        Commands::Init => {
            match &cli.config {
                Some(path) => config::save_config_to(&config, path).await?,
                None => config::save_config(&config).await?,
            }
            println!("✓ Config written");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn load_policy(path: &Path) -> CliResult<FilteringPolicy> {
    Ok(load_document(path).await?.into_policy(Uuid::nil()))
}

async fn check(path: &Path) -> CliResult<ExitCode> {
    let policy = load_policy(path).await?;
    let (checked, report) = match check_policy(&policy) {
        Ok(result) => result,
        Err(e) => {
            println!("✗ {} is invalid:", path.display());
            for detail in &e.details {
                println!("  - {detail}");
            }
            return Ok(ExitCode::FAILURE);
        }
    };

    println!(
        "{}: {} rules ({} enabled), default {}",
        policy.name,
        policy.rules.len(),
        checked.len(),
        policy.default_action
    );
    for finding in &report.findings {
        let mark = match finding.severity {
            Severity::Error => "✗",
            Severity::Warning => "!",
            Severity::Info => "·",
        };
        println!("  {mark} {finding}");
    }

    let mut notes: Vec<String> = Vec::new();
    for rule in &checked {
        for net in rule.sources.iter().chain(&rule.destinations) {
            notes.extend(check_reserved_ip(net).map(|n| format!("rule #{}: {n}", rule.position)));
        }
        for span in &rule.destination_ports {
            if span.is_single() {
                notes.extend(
                    check_well_known_port(span.start).map(|n| format!("rule #{}: {n}", rule.position)),
                );
            }
        }
    }
    for note in notes {
        println!("  note: {note}");
    }

    if report.has_errors() {
        println!("✗ Fatal conflicts found; the policy will not compile.");
        Ok(ExitCode::FAILURE)
    } else {
        println!("✓ Policy compiles.");
        Ok(ExitCode::SUCCESS)
    }
}

async fn compile_document(path: &Path, format: Format) -> CliResult<ExitCode> {
    let policy = load_policy(path).await?;
    let compiled = compile(&policy, 1)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&compiled.to_nftables_json())?),
        Format::Nft => print!("{}", compiled.to_nft_text()),
        Format::Text => {
            print!("{}", instructions_summary(&compiled.instructions));
            println!("checksum {}", compiled.checksum);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn diff(old: &Path, new: &Path) -> CliResult<ExitCode> {
    let old = compile(&load_policy(old).await?, 1)?;
    let new = compile(&load_policy(new).await?, 2)?;
    match diff_nft(&old, &new) {
        Some(text) => print!("{text}"),
        None => println!("No changes."),
    }
    Ok(ExitCode::SUCCESS)
}

fn open_store(path: Option<&Path>, config: &AppConfig) -> CliResult<Arc<dyn Store>> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| config.resolved_store_path())
        .ok_or("no store path configured and no data directory available")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fireflow::utils::create_private_dir(parent)?;
    }
    Ok(Arc::new(JsonFileStore::open(path)?))
}

struct ApplyRequest {
    policy: PathBuf,
    firewall: String,
    environment: Environment,
    principal: Principal,
}

async fn apply<T: ApplyTarget>(
    request: ApplyRequest,
    store: Arc<dyn Store>,
    target: T,
    config: AppConfig,
) -> CliResult<ExitCode> {
    let document: PolicyDocument = load_document(&request.policy).await?;
    fireflow::utils::ensure_dirs()?;
    let who = &request.principal;
    let auditor = Auditor::from_config(config.enable_audit_log);
    let engine = Engine::with_store(store, target, config, auditor);
    let workers = engine.orchestrator().config().workers;
    let wait = task_deadline(engine.orchestrator().config());

    let firewall = match engine.find_firewall(&request.firewall)? {
        Some(fw) => fw,
        None => {
            engine
                .create_firewall(who, &request.firewall, request.environment, "", None)
                .await?
        }
    };
    let existing = engine
        .policies(firewall.id)?
        .into_iter()
        .find(|p| p.name == document.name);
    let policy = match existing {
        Some(p) => p,
        None => {
            engine
                .create_policy(
                    who,
                    firewall.id,
                    &document.name,
                    document.default_action,
                    document.description.as_deref(),
                )
                .await?
        }
    };
    let imported = document.into_policy(firewall.id);
    engine
        .replace_rules(who, policy.id, imported.default_action, imported.rules)
        .await?;

    let compiled = engine.compile_policy(who, policy.id).await?;
    println!(
        "Compiled {} v{} ({} instructions)",
        policy.name,
        compiled.version.version,
        compiled.instructions.len()
    );

    let orchestrator = engine.orchestrator();
    orchestrator.recover()?;
    let cancel = CancellationToken::new();
    let handles = orchestrator.spawn_workers(workers, &cancel);

    let task = engine.submit(who, firewall.id, compiled.version).await?;
    let task = orchestrator.wait_for(task.id, wait).await?;
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    let firewall = engine.firewall(firewall.id)?;
    match task.state {
        TaskState::Succeeded => {
            println!("✓ {} is now {} ({})", firewall.name, compiled.version, firewall.state);
            Ok(ExitCode::SUCCESS)
        }
        state => {
            println!("✗ Task {} ended as {state} after {} attempt(s)", task.id, task.attempts);
            if let Some(error) = &task.last_error {
                let translation = TargetErrorPattern::match_error(error);
                println!("  {}", translation.user_message);
                for suggestion in &translation.suggestions {
                    println!("  • {suggestion}");
                }
            }
            if task.rolled_back {
                println!("  Rolled back; firewall is {}", firewall.state);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Upper bound on how long a task can take with every retry used.
fn task_deadline(config: &AppConfig) -> Duration {
    let attempts = config.retry.max_attempts + 1;
    config.apply_timeout() * attempts + config.retry.max_backoff() * attempts
}

fn status(name: &str, store: Arc<dyn Store>) -> CliResult<ExitCode> {
    let Some(firewall) = store.find_firewall_by_name(name)? else {
        println!("No firewall named '{name}'.");
        return Ok(ExitCode::FAILURE);
    };
    println!("{} [{}] {}", firewall.name, firewall.environment, firewall.state);
    match firewall.applied {
        Some(v) => println!("  applied:   {v}"),
        None => println!("  applied:   none"),
    }
    if let Some(v) = firewall.latest_submission {
        println!("  submitted: {v}");
    }
    if let Some(task) = store.list_tasks(firewall.id)?.last() {
        println!(
            "  last task: {} {} (attempts {}{})",
            task.id,
            task.state,
            task.attempts,
            if task.rolled_back { ", rolled back" } else { "" }
        );
        if let Some(error) = &task.last_error {
            println!("  error:     {}", truncate_string(error, 200));
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn export(firewall: &str, policy: &str, output: &Path, store: Arc<dyn Store>) -> CliResult<ExitCode> {
    let firewall = store
        .find_firewall_by_name(firewall)?
        .ok_or_else(|| format!("no firewall named '{firewall}'"))?;
    let policy = store
        .list_policies(firewall.id)?
        .into_iter()
        .find(|p| p.name == policy)
        .ok_or_else(|| format!("no policy named '{policy}' on {}", firewall.name))?;
    save_document(output, &PolicyDocument::from_policy(&policy)).await?;
    println!("✓ Exported {} ({} rules) to {}", policy.name, policy.rules.len(), output.display());
    Ok(ExitCode::SUCCESS)
}
