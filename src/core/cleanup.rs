//! SH-009: Tag-based cleanup.
//!
//! Everything carrying the project tag is deleted tier by tier in
//! `ResourceKind::cleanup_priority` order, independent of any state
//! document. Individual failures are recorded and skipped; the pass always
//! runs to the end. A final listing reports what is still there.

use super::error::StackError;
use super::retry::{retry, RetryPolicy, Sleeper};
use super::types::{ResourceKind, Settings, TaggedResource, WorkflowEvent};
use crate::console;
use crate::journal::Journal;
use crate::provider::{CloudProvider, TagListing};

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub found: Vec<TaggedResource>,
    pub deleted: Vec<TaggedResource>,
    pub already_gone: Vec<TaggedResource>,
    pub skipped: Vec<(TaggedResource, String)>,
    pub failed: Vec<(TaggedResource, String)>,
    /// Discovery sources that could not be listed, with the error
    pub unlisted: Vec<(String, String)>,
    /// Still listed after the deletion pass
    pub leftovers: Vec<TaggedResource>,
    /// Whether the post-deletion listing covered every source
    pub verified: bool,
}

impl CleanupReport {
    /// Nothing failed and nothing tagged is known or suspected to remain.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.leftovers.is_empty() && self.unlisted.is_empty()
    }
}

/// Resources grouped into deletion tiers, plus those that will not be touched.
#[derive(Debug, Clone, Default)]
pub struct DeletionPlan {
    pub tiers: Vec<Vec<TaggedResource>>,
    pub skipped: Vec<(TaggedResource, String)>,
}

/// Order `resources` for deletion. The backend bucket and unknown kinds are
/// set aside.
pub fn deletion_plan(resources: &[TaggedResource], backend_bucket: &str) -> DeletionPlan {
    let mut plan = DeletionPlan::default();
    let mut ordered: Vec<TaggedResource> = Vec::new();
    for r in resources {
        if r.kind == ResourceKind::Unknown {
            plan.skipped
                .push((r.clone(), "no delete operation for this type".into()));
        } else if r.kind == ResourceKind::S3Bucket && r.id == backend_bucket {
            plan.skipped
                .push((r.clone(), "backend state bucket".into()));
        } else {
            ordered.push(r.clone());
        }
    }
    ordered.sort_by(|a, b| {
        a.kind
            .cleanup_priority()
            .cmp(&b.kind.cleanup_priority())
            .then_with(|| a.kind.to_string().cmp(&b.kind.to_string()))
            .then_with(|| a.id.cmp(&b.id))
    });
    for r in ordered {
        match plan.tiers.last_mut() {
            Some(tier)
                if tier
                    .first()
                    .is_some_and(|x| x.kind.cleanup_priority() == r.kind.cleanup_priority()) =>
            {
                tier.push(r)
            }
            _ => plan.tiers.push(vec![r]),
        }
    }
    plan
}

fn list(
    settings: &Settings,
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
) -> Result<TagListing, StackError> {
    retry(
        RetryPolicy::from(&settings.retry),
        sleeper,
        "list-tagged",
        || provider.list_tagged(&settings.cleanup_tag),
    )
    .map(|a| a.value)
}

/// Delete every resource tagged with the project's cleanup tag.
///
/// Only a failure to list at all is returned as an error. A discovery source
/// that fails is reported in `unlisted` and the resources the other sources
/// found are still deleted.
pub fn cleanup(
    settings: &Settings,
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
    journal: &Journal,
    options: CleanupOptions,
) -> Result<CleanupReport, StackError> {
    let tag = &settings.cleanup_tag;
    console::info(&format!("listing resources tagged {}={}", tag.key, tag.value));
    let listing = list(settings, provider, sleeper)?;
    for (source, error) in &listing.failures {
        console::warn(&format!("could not list {}: {}", source, error));
    }
    let plan = deletion_plan(&listing.resources, &settings.bucket);

    let mut report = CleanupReport {
        dry_run: options.dry_run,
        found: listing.resources,
        unlisted: listing.failures,
        ..Default::default()
    };
    for (r, reason) in &plan.skipped {
        console::warn(&format!("skipping {}: {}", r, reason));
        journal.record(WorkflowEvent::ResourceSkipped {
            kind: r.kind,
            id: r.id.clone(),
            reason: reason.clone(),
        });
    }
    report.skipped = plan.skipped;

    if report.found.is_empty() {
        console::ok("no tagged resources found");
        report.verified = report.unlisted.is_empty();
        return Ok(report);
    }

    if options.dry_run {
        for r in plan.tiers.iter().flatten() {
            console::info(&format!("would delete {}", r));
        }
        return Ok(report);
    }

    let policy = RetryPolicy::from(&settings.retry);
    let tier_count = plan.tiers.len();
    for (i, tier) in plan.tiers.into_iter().enumerate() {
        let needs_settle = tier.iter().any(|r| r.kind.deletes_asynchronously());
        for r in tier {
            let step = format!("delete {}", r);
            match retry(policy, sleeper, &step, || provider.delete_resource(&r)) {
                Ok(_) => {
                    console::ok(&format!("deleted {}", r));
                    journal.record(WorkflowEvent::ResourceDeleted {
                        kind: r.kind,
                        id: r.id.clone(),
                    });
                    report.deleted.push(r);
                }
                Err(e) if e.is_not_found() => {
                    console::info(&format!("{} already gone", r));
                    journal.record(WorkflowEvent::ResourceAlreadyGone {
                        kind: r.kind,
                        id: r.id.clone(),
                    });
                    report.already_gone.push(r);
                }
                Err(e) => {
                    console::fail(&format!("could not delete {}: {}", r, e));
                    journal.record(WorkflowEvent::ResourceDeleteFailed {
                        kind: r.kind,
                        id: r.id.clone(),
                        error: e.to_string(),
                    });
                    report.failed.push((r, e.to_string()));
                }
            }
        }
        if needs_settle && i + 1 < tier_count {
            console::info(&format!(
                "waiting {}s for deletions to settle",
                settings.teardown.settle_secs
            ));
            sleeper.sleep(settings.settle_delay());
        }
    }

    match list(settings, provider, sleeper) {
        Ok(remaining) => {
            report.verified = remaining.failures.is_empty();
            for (source, error) in &remaining.failures {
                console::warn(&format!("could not re-list {}: {}", source, error));
            }
            report.leftovers = remaining
                .resources
                .into_iter()
                .filter(|r| !report.skipped.iter().any(|(s, _)| s == r))
                .collect();
            for r in &report.leftovers {
                console::warn(&format!("still present: {}", r));
            }
        }
        Err(e) => console::warn(&format!("could not verify cleanup: {}", e)),
    }

    Ok(report)
}
