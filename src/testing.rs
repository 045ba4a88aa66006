//! In-memory stand-ins for Terraform, AWS and the clock.
//!
//! Every fake keeps a call log so tests can assert on ordering, and can be
//! told to fail an operation a fixed number of times (or forever) to drive
//! retry and fallback paths.

use crate::core::error::StackError;
use crate::core::retry::Sleeper;
use crate::core::types::{ResourceKind, Tag, TaggedResource};
use crate::engine::{BackendConfig, ConvergenceEngine, Variables};
use crate::provider::{CloudProvider, TagListing};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Write an executable bash script named `name` into `dir`. Stands in for
/// `aws` or `terraform` in tests that exercise the real CLI wrappers.
pub fn fake_cli(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/usr/bin/env bash\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Remaining failure budget per operation key.
#[derive(Default)]
struct Failures(RefCell<HashMap<String, u32>>);

impl Failures {
    fn set(&self, key: &str, times: u32) {
        self.0.borrow_mut().insert(key.to_string(), times);
    }

    /// Consume one failure for `key`, if any remain.
    fn take(&self, key: &str) -> bool {
        let mut map = self.0.borrow_mut();
        match map.get_mut(key) {
            Some(0) | None => false,
            Some(n) => {
                if *n != u32::MAX {
                    *n -= 1;
                }
                true
            }
        }
    }
}

// ============================================================================
// Sleeper
// ============================================================================

#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Default)]
pub struct FakeEngine {
    calls: RefCell<Vec<String>>,
    failures: Failures,
    missing: bool,
    outputs: IndexMap<String, serde_json::Value>,
    addresses: Vec<String>,
    last_vars: RefCell<Variables>,
    last_backend: RefCell<Option<BackendConfig>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `op` (`init`, `destroy`, ...) the next `times` calls.
    pub fn failing(self, op: &str, times: u32) -> Self {
        self.failures.set(op, times);
        self
    }

    /// Fail `op` on every call.
    pub fn always_failing(self, op: &str) -> Self {
        self.failing(op, u32::MAX)
    }

    pub fn unavailable(mut self) -> Self {
        self.missing = true;
        self
    }

    pub fn with_output(mut self, name: &str, value: serde_json::Value) -> Self {
        self.outputs.insert(name.to_string(), value);
        self
    }

    pub fn with_addresses(mut self, addresses: &[&str]) -> Self {
        self.addresses = addresses.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.borrow().iter().filter(|c| *c == op).count()
    }

    pub fn last_vars(&self) -> Variables {
        self.last_vars.borrow().clone()
    }

    pub fn last_backend(&self) -> Option<BackendConfig> {
        self.last_backend.borrow().clone()
    }

    fn invoke(&self, op: &str) -> Result<(), StackError> {
        self.calls.borrow_mut().push(op.to_string());
        if self.failures.take(op) {
            Err(StackError::Convergence {
                command: op.to_string(),
                code: 1,
                stderr: format!("simulated {} failure", op),
            })
        } else {
            Ok(())
        }
    }
}

impl ConvergenceEngine for FakeEngine {
    fn check_available(&self) -> Result<(), StackError> {
        if self.missing {
            Err(StackError::Precondition("terraform not found on PATH".into()))
        } else {
            Ok(())
        }
    }

    fn init(&self, backend: &BackendConfig) -> Result<(), StackError> {
        *self.last_backend.borrow_mut() = Some(backend.clone());
        self.invoke("init")
    }

    fn validate(&self) -> Result<(), StackError> {
        self.invoke("validate")
    }

    fn plan(&self, vars: &Variables) -> Result<(), StackError> {
        *self.last_vars.borrow_mut() = vars.clone();
        self.invoke("plan")
    }

    fn apply(&self) -> Result<(), StackError> {
        self.invoke("apply")
    }

    fn destroy(&self, vars: &Variables) -> Result<(), StackError> {
        *self.last_vars.borrow_mut() = vars.clone();
        self.invoke("destroy")
    }

    fn output(&self) -> Result<IndexMap<String, serde_json::Value>, StackError> {
        self.invoke("output")?;
        Ok(self.outputs.clone())
    }

    fn refresh(&self, vars: &Variables) -> Result<(), StackError> {
        *self.last_vars.borrow_mut() = vars.clone();
        self.invoke("refresh")
    }

    fn state_list(&self) -> Result<Vec<String>, StackError> {
        self.invoke("state list")?;
        Ok(self.addresses.clone())
    }
}

// ============================================================================
// Provider
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeBucket {
    pub region: String,
    pub versioned: bool,
    pub public_blocked: bool,
    pub tags: IndexMap<String, String>,
}

#[derive(Default)]
pub struct FakeProvider {
    calls: RefCell<Vec<String>>,
    failures: Failures,
    no_credentials: bool,
    buckets: RefCell<IndexMap<String, FakeBucket>>,
    resources: RefCell<Vec<(Tag, TaggedResource)>>,
    /// Resources that are deleted but keep showing up when listed
    sticky: RefCell<Vec<String>>,
    /// Resources still listed but already gone when deleted
    vanished: RefCell<Vec<String>>,
    /// Discovery sources that fail, with the kinds they would have found
    unlistable: RefCell<Vec<(String, Vec<ResourceKind>)>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, name: &str) -> Self {
        self.buckets.borrow_mut().insert(
            name.to_string(),
            FakeBucket {
                region: "us-east-1".into(),
                ..Default::default()
            },
        );
        self
    }

    /// Add a resource carrying `tag`.
    pub fn with_resource(self, tag: &Tag, kind: ResourceKind, id: &str) -> Self {
        self.resources.borrow_mut().push((
            tag.clone(),
            TaggedResource {
                kind,
                id: id.to_string(),
                arn: format!("arn:fake:{}:{}", kind, id),
            },
        ));
        self
    }

    /// Fail operation `key` the next `times` calls. Keys are method names
    /// (`create_bucket`, `list_tagged`, ...) or `delete:<id>`.
    pub fn failing(self, key: &str, times: u32) -> Self {
        self.failures.set(key, times);
        self
    }

    pub fn always_failing(self, key: &str) -> Self {
        self.failing(key, u32::MAX)
    }

    /// Make a delete of `id` report success without removing it.
    pub fn sticky(self, id: &str) -> Self {
        self.sticky.borrow_mut().push(id.to_string());
        self
    }

    /// Make a delete of `id` answer not-found (and drop it from listings).
    pub fn vanished(self, id: &str) -> Self {
        self.vanished.borrow_mut().push(id.to_string());
        self
    }

    /// Make discovery source `source` fail; resources of `kinds` are then
    /// missing from every listing.
    pub fn unlistable(self, source: &str, kinds: &[ResourceKind]) -> Self {
        self.unlistable
            .borrow_mut()
            .push((source.to_string(), kinds.to_vec()));
        self
    }

    pub fn without_credentials(mut self) -> Self {
        self.no_credentials = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn bucket(&self, name: &str) -> Option<FakeBucket> {
        self.buckets.borrow().get(name).cloned()
    }

    pub fn remaining(&self) -> Vec<TaggedResource> {
        self.resources
            .borrow()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Position of the first call equal to `call` in the log.
    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls.borrow().iter().position(|c| c == call)
    }

    fn invoke(&self, key: &str, call: String) -> Result<(), StackError> {
        self.calls.borrow_mut().push(call);
        if self.failures.take(key) {
            Err(StackError::provider(key, "simulated transient failure"))
        } else {
            Ok(())
        }
    }

    fn with_bucket_mut(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut FakeBucket),
    ) -> Result<(), StackError> {
        match self.buckets.borrow_mut().get_mut(bucket) {
            Some(b) => {
                f(b);
                Ok(())
            }
            None => Err(StackError::NotFound(format!("bucket {}", bucket))),
        }
    }
}

impl CloudProvider for FakeProvider {
    fn check_available(&self) -> Result<(), StackError> {
        Ok(())
    }

    fn caller_identity(&self) -> Result<String, StackError> {
        self.calls.borrow_mut().push("caller_identity".into());
        if self.no_credentials {
            Err(StackError::Precondition(
                "AWS credentials unusable: Unable to locate credentials".into(),
            ))
        } else {
            Ok("arn:aws:iam::123456789012:user/ci".into())
        }
    }

    fn bucket_exists(&self, bucket: &str) -> Result<bool, StackError> {
        self.invoke("bucket_exists", format!("bucket_exists {}", bucket))?;
        Ok(self.buckets.borrow().contains_key(bucket))
    }

    fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), StackError> {
        self.invoke("create_bucket", format!("create_bucket {}", bucket))?;
        self.buckets.borrow_mut().insert(
            bucket.to_string(),
            FakeBucket {
                region: region.to_string(),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn enable_versioning(&self, bucket: &str) -> Result<(), StackError> {
        self.invoke("enable_versioning", format!("enable_versioning {}", bucket))?;
        self.with_bucket_mut(bucket, |b| b.versioned = true)
    }

    fn block_public_access(&self, bucket: &str) -> Result<(), StackError> {
        self.invoke("block_public_access", format!("block_public_access {}", bucket))?;
        self.with_bucket_mut(bucket, |b| b.public_blocked = true)
    }

    fn tag_bucket(&self, bucket: &str, tags: &IndexMap<String, String>) -> Result<(), StackError> {
        self.invoke("tag_bucket", format!("tag_bucket {}", bucket))?;
        self.with_bucket_mut(bucket, |b| b.tags = tags.clone())
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), StackError> {
        self.invoke("delete_bucket", format!("delete_bucket {}", bucket))?;
        match self.buckets.borrow_mut().shift_remove(bucket) {
            Some(_) => Ok(()),
            None => Err(StackError::NotFound(format!("bucket {}", bucket))),
        }
    }

    fn list_tagged(&self, tag: &Tag) -> Result<TagListing, StackError> {
        self.invoke("list_tagged", format!("list_tagged {}={}", tag.key, tag.value))?;
        let unlistable = self.unlistable.borrow();
        let hidden = |kind: ResourceKind| unlistable.iter().any(|(_, kinds)| kinds.contains(&kind));
        Ok(TagListing {
            resources: self
                .resources
                .borrow()
                .iter()
                .filter(|(t, r)| t == tag && !hidden(r.kind))
                .map(|(_, r)| r.clone())
                .collect(),
            failures: unlistable
                .iter()
                .map(|(source, _)| (source.clone(), "simulated listing failure".to_string()))
                .collect(),
        })
    }

    fn delete_resource(&self, r: &TaggedResource) -> Result<(), StackError> {
        let key = format!("delete:{}", r.id);
        self.invoke(&key, format!("delete {}", r))?;
        if self.sticky.borrow().contains(&r.id) {
            return Ok(());
        }
        let mut resources = self.resources.borrow_mut();
        if self.vanished.borrow().contains(&r.id) {
            resources.retain(|(_, x)| x.id != r.id);
            return Err(StackError::NotFound(r.to_string()));
        }
        match resources.iter().position(|(_, x)| x.id == r.id) {
            Some(i) => {
                resources.remove(i);
                Ok(())
            }
            None => Err(StackError::NotFound(r.to_string())),
        }
    }
}
