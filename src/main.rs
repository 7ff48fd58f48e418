//! pfguard - safe apply for pf rulesets
//!
//! # Usage
//!
//! ```bash
//! pfguard apply                        # load /etc/pf.conf.new, roll back in 10 minutes
//! pfguard apply pf.conf.new -d 5m      # custom candidate and delay
//! pfguard confirm                      # keep it: cancel rollback, promote to /etc/pf.conf
//! pfguard pending                      # is a rollback armed?
//! pfguard diff                         # what would change
//! pfguard status                       # pf state, fingerprint, pending rollback
//! ```

use clap::{Parser, Subcommand};
use pfguard::audit::{self, EventType};
use pfguard::config::{self, Settings};
use pfguard::core::diff::ruleset_diff;
use pfguard::core::error::PfctlErrorPattern;
use pfguard::core::filter::Pfctl;
use pfguard::core::runner::SystemRunner;
use pfguard::core::scheduler::{AtQueue, TaggedScheduler};
use pfguard::core::store::{FsRuleStore, fingerprint};
use pfguard::{ApplyOutcome, Coordinator, Error, RulesetLocation, SafeApplyConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

shadow_rs::shadow!(build);

type HostCoordinator =
    Coordinator<Pfctl<SystemRunner>, FsRuleStore, TaggedScheduler<AtQueue<SystemRunner>>>;

#[derive(Parser)]
#[command(name = "pfguard")]
#[command(
    about = "Apply pf rulesets with an automatic rollback until confirmed",
    long_about = None
)]
struct Cli {
    /// Settings file (default: $PFGUARD_CONFIG, then the XDG config dir)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a candidate ruleset and arm the rollback to the known-good rules
    Apply {
        /// Candidate ruleset file or directory (default: settings `candidate`)
        candidate: Option<PathBuf>,
        /// Time until the rollback fires, e.g. "10 min", "2h"
        #[arg(short, long)]
        delay: Option<String>,
        /// Print the diff against the known-good rules first
        #[arg(long)]
        show_diff: bool,
    },
    /// Cancel the pending rollback and promote the candidate to known-good
    Confirm {
        candidate: Option<PathBuf>,
        /// Where the candidate is promoted to (default: settings `known_good`)
        #[arg(long)]
        destination: Option<PathBuf>,
    },
    /// Show pf state, known-good fingerprint and pending rollback
    Status,
    /// Enable pf with a ruleset, without a rollback
    Enable { rules: Option<PathBuf> },
    /// Reload a ruleset without toggling pf, without a rollback
    Reload { rules: Option<PathBuf> },
    /// Disable pf
    Disable,
    /// Enable pf with the known-good rules unless it is already running
    Running,
    /// Report whether a rollback is armed
    Pending,
    /// Diff the known-good rules against a candidate
    Diff { candidate: Option<PathBuf> },
    /// Print the effective settings, optionally writing them to the settings file
    Config {
        #[arg(long)]
        write: bool,
    },
    /// Print version and build information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn report_error(error: &Error) {
    eprintln!("✗ {error}");
    let Some(stderr) = error.stderr().filter(|s| !s.is_empty()) else {
        return;
    };
    for line in stderr.lines() {
        eprintln!("    {line}");
    }
    let translation = PfctlErrorPattern::match_error(stderr);
    eprintln!("{}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  • {suggestion}");
    }
    if let Some(url) = translation.help_url {
        eprintln!("  See {url}");
    }
}

fn build_coordinator(settings: &Settings) -> pfguard::Result<HostCoordinator> {
    let filter = Pfctl::new(SystemRunner::new(), settings.pfctl_path.clone());
    let queue = AtQueue::new(
        SystemRunner::new(),
        settings.at_path.clone(),
        settings.atq_path.clone(),
        settings.atrm_path.clone(),
    );
    let scheduler = TaggedScheduler::new(queue, settings.rollback_tag.clone())?;
    Ok(Coordinator::new(
        filter,
        FsRuleStore::new(),
        scheduler,
        SafeApplyConfig::new(settings.known_good.clone()),
    ))
}

fn location(path: Option<PathBuf>, fallback: &Path) -> pfguard::Result<RulesetLocation> {
    let path = path.unwrap_or_else(|| fallback.to_path_buf());
    let path = std::path::absolute(&path)?;
    pfguard::validators::validate_rules_path(&path).map_err(Error::Precondition)?;
    Ok(RulesetLocation::new(path))
}

fn print_diff(old: &RulesetLocation, new: &RulesetLocation) -> pfguard::Result<()> {
    match ruleset_diff(old, new)? {
        Some(diff) => print!("{diff}"),
        None => println!("No differences between {old} and {new}"),
    }
    Ok(())
}

async fn primitive(
    audit_log: bool,
    event: EventType,
    rules: Option<&RulesetLocation>,
    result: pfguard::Result<String>,
) -> pfguard::Result<ExitCode> {
    if audit_log {
        let details = serde_json::json!({ "rules": rules.map(ToString::to_string) });
        audit::record(
            event,
            result.is_ok(),
            details,
            result.as_ref().err().map(ToString::to_string),
        )
        .await;
    }
    let output = result?;
    println!("{}", output.trim_end());
    Ok(ExitCode::SUCCESS)
}

async fn handle_cli(cli: Cli) -> pfguard::Result<ExitCode> {
    let config_path = config::settings_path(cli.config.as_deref());
    let settings = match &config_path {
        Some(path) => config::load_settings(path).await?,
        None => Settings::default(),
    };
    if settings.audit_log
        && let Err(e) = pfguard::utils::ensure_dirs()
    {
        tracing::warn!("Failed to create state directories: {}", e);
    }

    match cli.command {
        Commands::Apply {
            candidate,
            delay,
            show_diff,
        } => {
            let coordinator = build_coordinator(&settings)?;
            let candidate = location(candidate, &settings.candidate)?;
            let delay = delay.unwrap_or_else(|| settings.default_delay.clone());

            if show_diff {
                print_diff(&coordinator.config().known_good, &candidate)?;
            }

            println!("Applying {candidate} (rollback in {delay})...");
            let outcome = coordinator.apply(&candidate, &delay).await;

            if settings.audit_log {
                audit::log_apply(
                    &candidate.to_string(),
                    &delay,
                    outcome.is_ok(),
                    outcome.error().map(ToString::to_string),
                )
                .await;
                if let ApplyOutcome::Armed {
                    job, known_good, ..
                } = &outcome
                {
                    audit::log_arm(&job.id, &known_good.to_string_lossy(), &delay).await;
                }
            }

            if outcome.is_ok() {
                println!("✓ {}", outcome.message());
                println!("  Run `pfguard confirm` to keep these rules.");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{}", outcome.message());
                if let Some(error) = outcome.error() {
                    report_error(error);
                }
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Confirm {
            candidate,
            destination,
        } => {
            let coordinator = build_coordinator(&settings)?;
            let candidate = location(candidate, &settings.candidate)?;
            let destination = location(destination, &settings.known_good)?;

            let outcome = coordinator.confirm(&candidate, &destination).await;

            if settings.audit_log {
                audit::log_confirm(
                    &candidate.to_string(),
                    &destination.to_string(),
                    outcome.is_ok(),
                    outcome.error().map(ToString::to_string),
                )
                .await;
            }

            if outcome.is_ok() {
                println!("✓ {}", outcome.message());
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{}", outcome.message());
                if let Some(error) = outcome.error() {
                    report_error(error);
                }
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Status => {
            let coordinator = build_coordinator(&settings)?;
            let known_good = &coordinator.config().known_good;

            println!("pf:         {}", coordinator.status().await?);
            match known_good.resolve() {
                Ok(file) => println!(
                    "Known-good: {} (sha256 {})",
                    file.display(),
                    fingerprint(known_good.path())?
                ),
                Err(_) => println!("Known-good: {known_good} (missing)"),
            }
            let backup = known_good.backup_path();
            if backup.exists() {
                println!("Backup:     {}", backup.display());
            }
            println!("Rollback:   {}", coordinator.phase().await?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Enable { rules } => {
            let coordinator = build_coordinator(&settings)?;
            let rules = location(rules, &settings.known_good)?;
            let result = coordinator.enable(&rules).await;
            primitive(settings.audit_log, EventType::Enable, Some(&rules), result).await
        }
        Commands::Reload { rules } => {
            let coordinator = build_coordinator(&settings)?;
            let rules = location(rules, &settings.known_good)?;
            let result = coordinator.reload(&rules).await;
            primitive(settings.audit_log, EventType::Reload, Some(&rules), result).await
        }
        Commands::Disable => {
            let coordinator = build_coordinator(&settings)?;
            let result = coordinator.disable().await;
            primitive(settings.audit_log, EventType::Disable, None, result).await
        }
        Commands::Running => {
            let coordinator = build_coordinator(&settings)?;
            let rules = coordinator.config().known_good.clone();
            let result = coordinator.ensure_running(&rules).await.map(|started| {
                if started {
                    format!("Enabled pf with {rules}")
                } else {
                    "pf is already running".to_string()
                }
            });
            primitive(settings.audit_log, EventType::Enable, Some(&rules), result).await
        }
        Commands::Pending => {
            let coordinator = build_coordinator(&settings)?;
            let jobs = coordinator.scheduler().jobs().await?;
            if jobs.is_empty() {
                println!("No rollback armed");
            }
            for job in &jobs {
                println!("Rollback job {}: {}", job.id, job.scheduled);
            }
            println!("Phase: {}", coordinator.phase().await?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Diff { candidate } => {
            let known_good = location(None, &settings.known_good)?;
            let candidate = location(candidate, &settings.candidate)?;
            print_diff(&known_good, &candidate)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { write } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if write {
                let path = config_path.ok_or_else(|| {
                    Error::Config("no settings location; pass --config".to_string())
                })?;
                config::save_settings(&settings, &path).await?;
                println!("✓ Wrote {}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Version => {
            println!("pfguard {}", build::PKG_VERSION);
            println!("commit:  {}", build::SHORT_COMMIT);
            println!("built:   {}", build::BUILD_TIME);
            println!("rustc:   {}", build::RUST_VERSION);
            Ok(ExitCode::SUCCESS)
        }
    }
}
