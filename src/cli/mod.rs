//! SH-017: CLI subcommands: init, validate, bootstrap, up, plan, destroy,
//! cleanup, state, status, schema, completions.

use crate::console;
use crate::core::bootstrap::{self, BootstrapOptions, StepStatus};
use crate::core::cleanup::{self, CleanupOptions, CleanupReport};
use crate::core::hygiene::{self, CleanOutcome};
use crate::core::metadata;
use crate::core::parser::{self, CliOverrides};
use crate::core::provision::{self, ProvisionOptions};
use crate::core::retry::ThreadSleeper;
use crate::core::teardown::{self, TeardownOptions, TeardownOutcome};
use crate::core::types::{Settings, StackConfig};
use crate::engine::terraform::TerraformCli;
use crate::engine::ConvergenceEngine;
use crate::journal::eventlog::tail_events;
use crate::journal::{hasher, Journal};
use crate::provider::aws::AwsCli;
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "stackhand",
    version,
    about = "Terraform/AWS stack orchestration: state bootstrap, provisioning, teardown with fallback"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Path to stackhand.yaml
    #[arg(short, long, global = true, default_value = "stackhand.yaml")]
    pub file: PathBuf,

    /// Environment (default: from config)
    #[arg(short, long, global = true, env = "STACKHAND_ENV")]
    pub env: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter stackhand.yaml
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate stackhand.yaml without touching the cloud
    Validate,

    /// Create (or reuse) and harden the remote-state bucket
    Bootstrap {
        /// Override the bucket name
        #[arg(long)]
        bucket: Option<String>,

        #[arg(long)]
        region: Option<String>,

        #[arg(long)]
        profile: Option<String>,

        /// Show the steps without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Empty and delete the bucket instead
        #[arg(long)]
        destroy: bool,

        /// Skip confirmation for --destroy
        #[arg(long)]
        force: bool,
    },

    /// Bootstrap, then terraform init/validate/plan/apply and post-apply hooks
    Up {
        /// Stop after terraform plan
        #[arg(long)]
        dry_run: bool,

        /// Reuse the existing backend without checking it
        #[arg(long)]
        skip_bootstrap: bool,
    },

    /// terraform init + validate + plan against the existing backend
    Plan,

    /// Tear everything down, falling back to tag-based cleanup
    Destroy {
        /// List what would be destroyed
        #[arg(long)]
        dry_run: bool,

        /// Skip confirmation
        #[arg(long)]
        force: bool,

        /// Go straight to tag-based cleanup (lost or unusable state)
        #[arg(long)]
        skip_engine: bool,
    },

    /// Delete every resource carrying the project tag
    Cleanup {
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        force: bool,
    },

    /// State file hygiene
    State {
        #[command(subcommand)]
        action: StateCommands,
    },

    /// Resolved settings, backend metadata, recent journal events
    Status,

    /// Print the JSON Schema of stackhand.yaml
    Schema,

    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Copy the state file to a timestamped backup
    Backup,

    /// Check size and shape, then refresh against the provider
    Validate {
        /// Skip the refresh
        #[arg(long)]
        offline: bool,
    },

    /// Back up and remove a corrupted state file
    Clean {
        /// Remove even a healthy state file
        #[arg(long)]
        force: bool,
    },

    /// Resource counts, sizes, hashes, backups
    Info,
}

/// Parse arguments and run.
pub fn run(cli: Cli) -> Result<(), String> {
    dispatch(cli.command, &cli.global)
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands, global: &GlobalArgs) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate => cmd_validate(&global.file),
        Commands::Bootstrap {
            bucket,
            region,
            profile,
            dry_run,
            destroy,
            force,
        } => {
            let overrides = CliOverrides {
                environment: global.env.clone(),
                region,
                profile,
                bucket,
            };
            let settings = load_settings(&global.file, &overrides)?;
            if destroy {
                cmd_destroy_backend(&settings, force)
            } else {
                cmd_bootstrap(&settings, dry_run)
            }
        }
        Commands::Up {
            dry_run,
            skip_bootstrap,
        } => cmd_up(&load(global)?, dry_run, skip_bootstrap),
        Commands::Plan => cmd_plan(&load(global)?),
        Commands::Destroy {
            dry_run,
            force,
            skip_engine,
        } => cmd_destroy(&load(global)?, dry_run, force, skip_engine),
        Commands::Cleanup { dry_run, force } => cmd_cleanup(&load(global)?, dry_run, force),
        Commands::State { action } => {
            let settings = load(global)?;
            match action {
                StateCommands::Backup => cmd_state_backup(&settings),
                StateCommands::Validate { offline } => cmd_state_validate(&settings, offline),
                StateCommands::Clean { force } => cmd_state_clean(&settings, force),
                StateCommands::Info => cmd_state_info(&settings),
            }
        }
        Commands::Status => cmd_status(&load(global)?),
        Commands::Schema => cmd_schema(),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "stackhand", &mut std::io::stdout());
            Ok(())
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Parse and validate a config file, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<StackConfig, String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

fn load_settings(file: &Path, overrides: &CliOverrides) -> Result<Settings, String> {
    let config = parse_and_validate(file)?;
    let base_dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    parser::resolve_settings(&config, overrides, base_dir)
}

fn load(global: &GlobalArgs) -> Result<Settings, String> {
    load_settings(
        &global.file,
        &CliOverrides {
            environment: global.env.clone(),
            ..Default::default()
        },
    )
}

fn engine_for(settings: &Settings) -> TerraformCli {
    TerraformCli::new(&settings.terraform_dir)
}

fn provider_for(settings: &Settings) -> AwsCli {
    AwsCli::new(Some(&settings.region), settings.profile.as_deref())
}

/// Ask before destructive work. Non-interactive sessions must pass --force.
fn confirm(prompt: &str, force: bool) -> Result<bool, String> {
    if force {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        return Err("refusing to continue without --force in a non-interactive session".into());
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| format!("prompt failed: {}", e))
}

// ============================================================================
// Commands
// ============================================================================

const TEMPLATE: &str = r#"version: "1.0"
project: my-stack
description: "Managed by stackhand"
default_environment: dev

terraform_dir: terraform
state_file: terraform/terraform.tfstate

defaults:
  region: us-east-1

environments:
  dev: {}
  prod:
    region: us-west-2

tags:
  Owner: platform

retry:
  attempts: 3
  delay_secs: 5

teardown:
  max_recovery_attempts: 1
  settle_secs: 30

hooks:
  post_apply: []

# Passed to terraform as -var. Set builtin_variables to also pass
# region, environment and project (declare them in the root module).
variables: {}
builtin_variables: false
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("stackhand.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }
    std::fs::create_dir_all(path)
        .map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&config_path, TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized stackhand project at {}", path.display());
    println!("  Created: {}", config_path.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        println!(
            "OK: {} ({} environments)",
            config.project,
            config.environments.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn cmd_bootstrap(settings: &Settings, dry_run: bool) -> Result<(), String> {
    let journal = Journal::new(&settings.journal);
    let report = journal
        .workflow("bootstrap", &settings.environment, || {
            bootstrap::bootstrap(
                settings,
                &provider_for(settings),
                &ThreadSleeper,
                &journal,
                BootstrapOptions { dry_run },
            )
        })
        .map_err(|e| e.to_string())?;

    println!();
    for (step, status) in &report.steps {
        let detail = match status {
            StepStatus::Done { attempts } if *attempts > 1 => format!("done ({} attempts)", attempts),
            StepStatus::Done { .. } => "done".to_string(),
            StepStatus::Skipped(reason) => format!("skipped: {}", reason),
            StepStatus::Planned => "would run".to_string(),
        };
        println!("  {:<20} {}", step, detail);
    }
    println!();
    if dry_run {
        println!("Dry run: no changes made.");
    } else {
        println!(
            "Backend ready: s3://{}/{} ({})",
            report.bucket, settings.state_key, report.region
        );
        println!("  Metadata: {}", settings.metadata_file.display());
    }
    Ok(())
}

fn cmd_destroy_backend(settings: &Settings, force: bool) -> Result<(), String> {
    let prompt = format!(
        "Delete state bucket {} and every state version in it?",
        settings.bucket
    );
    if !confirm(&prompt, force)? {
        println!("Aborted.");
        return Ok(());
    }
    let journal = Journal::new(&settings.journal);
    let deleted = journal
        .workflow("destroy-backend", &settings.environment, || {
            bootstrap::destroy_backend(settings, &provider_for(settings), &ThreadSleeper, &journal)
        })
        .map_err(|e| e.to_string())?;
    if deleted {
        println!("Deleted bucket {}", settings.bucket);
    } else {
        println!("Bucket {} did not exist", settings.bucket);
    }
    Ok(())
}

fn cmd_up(settings: &Settings, dry_run: bool, skip_bootstrap: bool) -> Result<(), String> {
    let journal = Journal::new(&settings.journal);
    let engine = engine_for(settings);
    let provider = provider_for(settings);
    let report = journal
        .workflow("up", &settings.environment, || {
            provision::provision(
                settings,
                &engine,
                &provider,
                &ThreadSleeper,
                &journal,
                ProvisionOptions {
                    dry_run,
                    skip_bootstrap,
                },
            )
        })
        .map_err(|e| e.to_string())?;

    println!();
    if !report.applied {
        println!("Dry run: nothing applied.");
        return Ok(());
    }
    println!(
        "Apply complete: {} ({}) in {}",
        settings.project, settings.environment, settings.region
    );
    for (name, value) in &report.outputs {
        println!("  {} = {}", name, value);
    }
    if report.hooks_run > 0 {
        println!("  {} post-apply hook(s) ran", report.hooks_run);
    }
    Ok(())
}

fn cmd_plan(settings: &Settings) -> Result<(), String> {
    let journal = Journal::new(&settings.journal);
    let engine = engine_for(settings);
    engine.check_available().map_err(|e| e.to_string())?;
    let vars = provision::engine_variables(settings, None);
    journal
        .workflow("plan", &settings.environment, || {
            provision::plan_only(settings, &engine, &ThreadSleeper, &journal, &vars)
        })
        .map_err(|e| e.to_string())
}

fn cmd_destroy(
    settings: &Settings,
    dry_run: bool,
    force: bool,
    skip_engine: bool,
) -> Result<(), String> {
    if !dry_run {
        let prompt = format!(
            "Destroy every resource of {} ({})?",
            settings.project, settings.environment
        );
        if !confirm(&prompt, force)? {
            println!("Aborted.");
            return Ok(());
        }
    }
    let journal = Journal::new(&settings.journal);
    let engine = engine_for(settings);
    let provider = provider_for(settings);
    let outcome: Result<TeardownOutcome, String> =
        journal.workflow("destroy", &settings.environment, || {
            Ok(teardown::teardown(
                settings,
                &engine,
                &provider,
                &ThreadSleeper,
                &journal,
                TeardownOptions {
                    dry_run,
                    skip_engine,
                },
            ))
        });
    let outcome = outcome?;

    println!();
    let path: Vec<String> = std::iter::once(
        outcome
            .transitions
            .first()
            .map(|(from, _)| from.to_string())
            .unwrap_or_default(),
    )
    .chain(outcome.transitions.iter().map(|(_, to)| to.to_string()))
    .collect();
    println!("Teardown: {}", path.join(" -> "));
    for e in &outcome.errors {
        println!("  fallback reason: {}", e);
    }
    if outcome.destroyed_by_engine {
        println!("terraform destroy completed.");
    }
    if let Some(ref report) = outcome.cleanup {
        print_cleanup(report);
    }
    if !dry_run && !outcome.is_clean() {
        console::warn("teardown finished with leftovers; re-run `stackhand cleanup` or inspect the console");
    }
    Ok(())
}

fn cmd_cleanup(settings: &Settings, dry_run: bool, force: bool) -> Result<(), String> {
    if !dry_run {
        let prompt = format!(
            "Delete every resource tagged {}={}?",
            settings.cleanup_tag.key, settings.cleanup_tag.value
        );
        if !confirm(&prompt, force)? {
            println!("Aborted.");
            return Ok(());
        }
    }
    let journal = Journal::new(&settings.journal);
    let report = journal
        .workflow("cleanup", &settings.environment, || {
            cleanup::cleanup(
                settings,
                &provider_for(settings),
                &ThreadSleeper,
                &journal,
                CleanupOptions { dry_run },
            )
        })
        .map_err(|e| e.to_string())?;
    println!();
    print_cleanup(&report);
    Ok(())
}

fn print_cleanup(report: &CleanupReport) {
    if report.dry_run {
        println!(
            "Cleanup (dry run): {} tagged resource(s), {} would be skipped.",
            report.found.len(),
            report.skipped.len()
        );
        for (source, error) in &report.unlisted {
            println!("  UNLISTED: {} ({})", source, error);
        }
        return;
    }
    println!(
        "Cleanup: {} found, {} deleted, {} already gone, {} skipped, {} failed.",
        report.found.len(),
        report.deleted.len(),
        report.already_gone.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for (r, reason) in &report.skipped {
        println!("  SKIPPED: {} ({})", r, reason);
    }
    for (r, error) in &report.failed {
        println!("  FAILED:  {} ({})", r, error);
    }
    for r in &report.leftovers {
        println!("  LEFT:    {}", r);
    }
    for (source, error) in &report.unlisted {
        println!("  UNLISTED: {} ({})", source, error);
    }
    if !report.verified {
        println!("  (could not re-list resources to verify)");
    }
}

fn cmd_state_backup(settings: &Settings) -> Result<(), String> {
    let journal = Journal::new(&settings.journal);
    let rec = hygiene::backup_state(settings, &journal).map_err(|e| e.to_string())?;
    println!("{} ({} bytes)", rec.path.display(), rec.bytes);
    println!("  {}", rec.hash);
    Ok(())
}

fn cmd_state_validate(settings: &Settings, offline: bool) -> Result<(), String> {
    let engine = engine_for(settings);
    let engine_ref: Option<&dyn ConvergenceEngine> = if offline {
        None
    } else {
        engine.check_available().map_err(|e| e.to_string())?;
        Some(&engine)
    };
    let vars = provision::engine_variables(settings, None);
    let validity = hygiene::validate_state(settings, engine_ref, &vars);
    println!("{}: {}", settings.state_file.display(), validity);
    if validity.is_valid() {
        Ok(())
    } else {
        Err("state is not valid".to_string())
    }
}

fn cmd_state_clean(settings: &Settings, force: bool) -> Result<(), String> {
    let journal = Journal::new(&settings.journal);
    match hygiene::clean_state(settings, force, &journal).map_err(|e| e.to_string())? {
        CleanOutcome::Removed { backup } => {
            println!("Removed {}", settings.state_file.display());
            println!("  Backup: {}", backup.path.display());
        }
        CleanOutcome::Kept { validity } => {
            println!("Kept {}: {} (use --force to remove anyway)", settings.state_file.display(), validity);
        }
        CleanOutcome::Missing => println!("No state file at {}", settings.state_file.display()),
    }
    Ok(())
}

fn cmd_state_info(settings: &Settings) -> Result<(), String> {
    let info = hygiene::state_info(settings).map_err(|e| e.to_string())?;
    println!("State: {}", info.path.display());
    println!("  Size:      {} bytes", info.bytes);
    println!("  Hash:      {}", hasher::short(&info.hash));
    if let Some(serial) = info.serial {
        println!("  Serial:    {}", serial);
    }
    if let Some(ref lineage) = info.lineage {
        println!("  Lineage:   {}", lineage);
    }
    if let Some(ref v) = info.terraform_version {
        println!("  Terraform: {}", v);
    }
    println!("  Resources: {}", info.resources);
    for (rtype, n) in &info.by_type {
        println!("    {:<40} {}", rtype, n);
    }
    println!("  Backups:   {}", info.backups.len());
    for (path, bytes) in &info.backups {
        println!("    {} ({} bytes)", path.display(), bytes);
    }
    Ok(())
}

fn cmd_status(settings: &Settings) -> Result<(), String> {
    println!("Project:     {}", settings.project);
    println!("Environment: {}", settings.environment);
    println!("Region:      {}", settings.region);
    if let Some(ref p) = settings.profile {
        println!("Profile:     {}", p);
    }
    println!("Backend:     s3://{}/{}", settings.bucket, settings.state_key);
    println!(
        "Cleanup tag: {}={}",
        settings.cleanup_tag.key, settings.cleanup_tag.value
    );

    match metadata::read_metadata(&settings.metadata_file).map_err(|e| e.to_string())? {
        Some(meta) => println!(
            "Metadata:    {} (bucket {}, written {})",
            settings.metadata_file.display(),
            meta.bucket,
            meta.created_at
        ),
        None => println!("Metadata:    none (run `stackhand bootstrap`)"),
    }

    let validity = hygiene::inspect(&settings.state_file, settings.hygiene.min_state_bytes);
    println!("State:       {}", validity);

    if settings.journal.enabled {
        let events = tail_events(&settings.journal.dir, 5)?;
        if !events.is_empty() {
            println!("Recent events:");
            for e in &events {
                let json = serde_json::to_string(&e.event).unwrap_or_default();
                println!("  {} {}", e.ts, json);
            }
        }
    }
    Ok(())
}

fn cmd_schema() -> Result<(), String> {
    let schema = schemars::schema_for!(StackConfig);
    let json = serde_json::to_string_pretty(&schema)
        .map_err(|e| format!("cannot serialize schema: {}", e))?;
    println!("{}", json);
    Ok(())
}
