//! SH-030: Cloud provider seam.
//!
//! Bucket bootstrap and tag-based cleanup talk to the cloud only through
//! `CloudProvider`. The real implementation shells out to the `aws` CLI;
//! tests substitute `testing::FakeProvider`.

pub mod arn;
pub mod aws;

use crate::core::error::StackError;
use crate::core::types::{Tag, TaggedResource};
use indexmap::IndexMap;

/// Outcome of a tag query. Discovery sources are queried one by one; a
/// source that cannot be listed is reported in `failures` and the others
/// still count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagListing {
    pub resources: Vec<TaggedResource>,
    /// `(source, error)` per discovery source that failed
    pub failures: Vec<(String, String)>,
}

pub trait CloudProvider {
    /// Precondition check: CLI present.
    fn check_available(&self) -> Result<(), StackError>;

    /// Account/principal the credentials resolve to. Fails with a
    /// precondition error when no usable credentials exist.
    fn caller_identity(&self) -> Result<String, StackError>;

    fn bucket_exists(&self, bucket: &str) -> Result<bool, StackError>;
    fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), StackError>;
    fn enable_versioning(&self, bucket: &str) -> Result<(), StackError>;
    fn block_public_access(&self, bucket: &str) -> Result<(), StackError>;
    fn tag_bucket(&self, bucket: &str, tags: &IndexMap<String, String>) -> Result<(), StackError>;

    /// Delete every object version, then the bucket.
    fn delete_bucket(&self, bucket: &str) -> Result<(), StackError>;

    /// Everything carrying `tag`, regardless of any state document.
    /// Fails only when no discovery source could be listed.
    fn list_tagged(&self, tag: &Tag) -> Result<TagListing, StackError>;

    /// Delete one resource, including the detach steps its kind needs first.
    /// Returns `StackError::NotFound` when the resource is already gone.
    fn delete_resource(&self, resource: &TaggedResource) -> Result<(), StackError>;
}
