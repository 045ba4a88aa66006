//! SH-006: Remote-state bucket bootstrap.
//!
//! Check-then-create: an existing bucket is reused, never recreated. The
//! hardening steps after creation are idempotent on the provider side, so a
//! re-run simply re-applies them.

use super::error::StackError;
use super::metadata::{self, BackendMetadata};
use super::retry::{run_step, RetryPolicy, Sleeper};
use super::types::Settings;
use crate::console;
use crate::journal::Journal;
use crate::provider::CloudProvider;

const WORKFLOW: &str = "bootstrap";

/// Steps in execution order.
pub const STEPS: &[&str] = &[
    "check-bucket",
    "create-bucket",
    "enable-versioning",
    "block-public-access",
    "tag-bucket",
    "write-metadata",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct BootstrapOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Done { attempts: u32 },
    Skipped(String),
    Planned,
}

#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub bucket: String,
    pub region: String,
    /// The bucket already existed and was reused
    pub reused: bool,
    pub dry_run: bool,
    pub steps: Vec<(String, StepStatus)>,
}

impl BootstrapReport {
    pub fn status(&self, step: &str) -> Option<&StepStatus> {
        self.steps.iter().find(|(s, _)| s == step).map(|(_, st)| st)
    }
}

/// Wraps one provider step: retry, journal, console, report.
struct Runner<'a> {
    policy: RetryPolicy,
    sleeper: &'a dyn Sleeper,
    journal: &'a Journal,
    steps: Vec<(String, StepStatus)>,
}

impl Runner<'_> {
    fn run<T>(
        &mut self,
        step: &str,
        mut op: impl FnMut() -> Result<T, StackError>,
    ) -> Result<T, StackError> {
        let mut attempts = 0u32;
        let value = run_step(self.journal, WORKFLOW, step, self.policy, self.sleeper, || {
            attempts += 1;
            op()
        })?;
        console::ok(step);
        self.steps
            .push((step.to_string(), StepStatus::Done { attempts }));
        Ok(value)
    }

    fn skip(&mut self, step: &str, reason: &str) {
        console::info(&format!("{}: skipped ({})", step, reason));
        self.steps
            .push((step.to_string(), StepStatus::Skipped(reason.to_string())));
    }

    fn plan(&mut self, step: &str) {
        console::info(&format!("{}: would run", step));
        self.steps.push((step.to_string(), StepStatus::Planned));
    }
}

/// Create (or reuse) and harden the state bucket, then write the metadata file.
pub fn bootstrap(
    settings: &Settings,
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
    journal: &Journal,
    options: BootstrapOptions,
) -> Result<BootstrapReport, StackError> {
    let bucket = settings.bucket.as_str();
    let mut runner = Runner {
        policy: RetryPolicy::from(&settings.retry),
        sleeper,
        journal,
        steps: Vec::new(),
    };

    console::info(&format!(
        "bootstrapping state bucket {} in {}",
        bucket, settings.region
    ));
    let exists = runner.run("check-bucket", || provider.bucket_exists(bucket))?;

    if exists {
        runner.skip("create-bucket", "bucket exists");
    } else if options.dry_run {
        runner.plan("create-bucket");
    } else {
        runner.run("create-bucket", || {
            provider.create_bucket(bucket, &settings.region)
        })?;
    }

    if options.dry_run {
        for step in &STEPS[2..] {
            runner.plan(step);
        }
    } else {
        runner.run("enable-versioning", || provider.enable_versioning(bucket))?;
        runner.run("block-public-access", || provider.block_public_access(bucket))?;
        runner.run("tag-bucket", || provider.tag_bucket(bucket, &settings.tags))?;

        let path = settings.metadata_file.as_path();
        if let Some(previous) = metadata::read_metadata(path).unwrap_or(None) {
            if previous.bucket != bucket {
                console::warn(&format!(
                    "metadata file pointed at bucket {}; replacing",
                    previous.bucket
                ));
            }
        }
        let meta = BackendMetadata::from_settings(settings);
        runner.run("write-metadata", || metadata::write_metadata(path, &meta))?;
    }

    Ok(BootstrapReport {
        bucket: bucket.to_string(),
        region: settings.region.clone(),
        reused: exists,
        dry_run: options.dry_run,
        steps: runner.steps,
    })
}

/// Empty and delete the state bucket, then remove the metadata file.
/// Returns whether a bucket was deleted.
pub fn destroy_backend(
    settings: &Settings,
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
    journal: &Journal,
) -> Result<bool, StackError> {
    let bucket = settings.bucket.as_str();
    let policy = RetryPolicy::from(&settings.retry);

    let exists = run_step(journal, "destroy-backend", "check-bucket", policy, sleeper, || {
        provider.bucket_exists(bucket)
    })?;
    let deleted = if exists {
        match run_step(journal, "destroy-backend", "delete-bucket", policy, sleeper, || {
            provider.delete_bucket(bucket)
        }) {
            Ok(()) => {
                console::ok(&format!("deleted bucket {}", bucket));
                true
            }
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        }
    } else {
        console::info(&format!("bucket {} does not exist", bucket));
        false
    };

    if metadata::remove_metadata(&settings.metadata_file)? {
        console::ok(&format!("removed {}", settings.metadata_file.display()));
    }
    Ok(deleted)
}
