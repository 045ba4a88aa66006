//! SH-001: Stack configuration, resolved settings, and workflow types.
//!
//! `StackConfig` is the on-disk `stackhand.yaml`. `Settings` is the flattened
//! view for one environment after defaults, environment overrides, and CLI
//! flags have been merged. All config types derive Serialize/Deserialize and
//! JsonSchema so `stackhand schema` can describe them.

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Top-level stackhand.yaml
// ============================================================================

/// Root configuration for one stack.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StackConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Project identifier; also the value of the cleanup tag
    pub project: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Environment used when none is given on the command line
    #[serde(default)]
    pub default_environment: Option<String>,

    /// Directory holding the Terraform configuration
    #[serde(default = "default_terraform_dir")]
    pub terraform_dir: PathBuf,

    /// Local Terraform state document
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Values shared by every environment
    #[serde(default)]
    pub defaults: EnvironmentOverrides,

    /// Per-environment overrides (order-preserving)
    #[serde(default)]
    pub environments: IndexMap<String, EnvironmentOverrides>,

    /// Extra tags applied to the state bucket
    #[serde(default)]
    pub tags: IndexMap<String, String>,

    /// Tag key whose value (the project) marks resources for cleanup
    #[serde(default = "default_tag_key")]
    pub tag_key: String,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub teardown: TeardownSettings,

    #[serde(default)]
    pub hygiene: HygieneSettings,

    /// Backend metadata file (KEY=value) for other scripts to source
    #[serde(default = "default_metadata_file")]
    pub metadata_file: PathBuf,

    #[serde(default)]
    pub journal: JournalSettings,

    #[serde(default)]
    pub ssh_key: SshKeySettings,

    #[serde(default)]
    pub hooks: Hooks,

    /// Terraform input variables (`-var key=value`)
    #[serde(default)]
    pub variables: IndexMap<String, String>,

    /// Also pass `region`, `environment` and `project` as Terraform
    /// variables. The root module must declare all three.
    #[serde(default)]
    pub builtin_variables: bool,
}

fn default_terraform_dir() -> PathBuf {
    PathBuf::from("terraform")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("terraform/terraform.tfstate")
}

fn default_metadata_file() -> PathBuf {
    PathBuf::from(".stackhand/backend.env")
}

fn default_tag_key() -> String {
    "Project".to_string()
}

/// Region/profile/bucket values, either shared defaults or one environment's overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentOverrides {
    #[serde(default)]
    pub region: Option<String>,

    /// AWS CLI profile; unset means the CLI's own environment decides
    #[serde(default)]
    pub profile: Option<String>,

    /// State bucket name
    #[serde(default)]
    pub bucket: Option<String>,

    /// Object key of the state document inside the bucket
    #[serde(default)]
    pub state_key: Option<String>,

    /// DynamoDB table for backend state locking
    #[serde(default)]
    pub lock_table: Option<String>,

    /// Additional Terraform variables for this environment
    #[serde(default)]
    pub variables: IndexMap<String, String>,
}

impl EnvironmentOverrides {
    /// Overlay `other` on top of `self`; set fields in `other` win.
    pub fn merged_with(&self, other: &EnvironmentOverrides) -> EnvironmentOverrides {
        let mut variables = self.variables.clone();
        for (k, v) in &other.variables {
            variables.insert(k.clone(), v.clone());
        }
        EnvironmentOverrides {
            region: other.region.clone().or_else(|| self.region.clone()),
            profile: other.profile.clone().or_else(|| self.profile.clone()),
            bucket: other.bucket.clone().or_else(|| self.bucket.clone()),
            state_key: other.state_key.clone().or_else(|| self.state_key.clone()),
            lock_table: other.lock_table.clone().or_else(|| self.lock_table.clone()),
            variables,
        }
    }
}

/// Bounded fixed-delay retry for transient provider errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RetrySettings {
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_secs: default_delay_secs(),
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_delay_secs() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TeardownSettings {
    /// Recovery attempts allowed before falling back to tag-based cleanup
    #[serde(default = "default_max_recovery")]
    pub max_recovery_attempts: u32,

    /// Wait after deleting resources that disappear asynchronously
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

impl Default for TeardownSettings {
    fn default() -> Self {
        Self {
            max_recovery_attempts: default_max_recovery(),
            settle_secs: default_settle_secs(),
        }
    }
}

fn default_max_recovery() -> u32 {
    1
}

fn default_settle_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HygieneSettings {
    /// State files smaller than this are treated as corrupted
    #[serde(default = "default_min_state_bytes")]
    pub min_state_bytes: u64,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

impl Default for HygieneSettings {
    fn default() -> Self {
        Self {
            min_state_bytes: default_min_state_bytes(),
            backup_dir: default_backup_dir(),
        }
    }
}

fn default_min_state_bytes() -> u64 {
    100
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from(".stackhand/backups")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JournalSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_journal_dir")]
    pub dir: PathBuf,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_journal_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_journal_dir() -> PathBuf {
    PathBuf::from(".stackhand/journal")
}

/// Ephemeral SSH key generated for a single provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SshKeySettings {
    #[serde(default)]
    pub enabled: bool,

    /// Terraform variable receiving the public key
    #[serde(default = "default_key_variable")]
    pub variable: String,
}

impl Default for SshKeySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            variable: default_key_variable(),
        }
    }
}

fn default_key_variable() -> String {
    "ssh_public_key".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Hooks {
    /// Shell snippets run with bash after a successful apply
    #[serde(default)]
    pub post_apply: Vec<String>,
}

// ============================================================================
// Resolved settings
// ============================================================================

/// A single `key=value` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Everything a workflow needs for one environment, fully resolved.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project: String,
    pub environment: String,
    pub region: String,
    pub profile: Option<String>,
    pub bucket: String,
    pub state_key: String,
    pub lock_table: Option<String>,
    pub terraform_dir: PathBuf,
    pub state_file: PathBuf,
    pub metadata_file: PathBuf,
    /// Tag identifying every resource of this project
    pub cleanup_tag: Tag,
    /// Full tag set for resources stackhand creates itself
    pub tags: IndexMap<String, String>,
    pub retry: RetrySettings,
    pub teardown: TeardownSettings,
    pub hygiene: HygieneSettings,
    pub journal: JournalSettings,
    pub ssh_key: SshKeySettings,
    pub hooks: Hooks,
    pub variables: IndexMap<String, String>,
    pub builtin_variables: bool,
}

impl Settings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry.delay_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.teardown.settle_secs)
    }
}

// ============================================================================
// Cloud resources
// ============================================================================

/// Kinds of tagged cloud resources the fallback cleanup knows how to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    AutoScalingGroup,
    Ec2Instance,
    LoadBalancer,
    TargetGroup,
    NatGateway,
    Certificate,
    KeyPair,
    Secret,
    IamInstanceProfile,
    IamRole,
    ElasticIp,
    InternetGateway,
    SecurityGroup,
    RouteTable,
    Subnet,
    Vpc,
    S3Bucket,
    Unknown,
}

impl ResourceKind {
    /// Dependency tier; lower tiers are deleted first.
    ///
    /// Load balancers and NAT gateways hold ENIs in subnets, so they go
    /// before subnets and the VPC. Instance profiles go before the roles
    /// they wrap.
    pub fn cleanup_priority(self) -> u8 {
        match self {
            Self::AutoScalingGroup => 0,
            Self::Ec2Instance | Self::LoadBalancer => 1,
            Self::TargetGroup | Self::NatGateway => 2,
            Self::Certificate | Self::KeyPair | Self::Secret | Self::IamInstanceProfile => 3,
            Self::IamRole | Self::ElasticIp => 4,
            Self::InternetGateway => 5,
            Self::SecurityGroup | Self::RouteTable => 6,
            Self::Subnet => 7,
            Self::Vpc => 8,
            Self::S3Bucket => 9,
            Self::Unknown => u8::MAX,
        }
    }

    /// Deletion returns before the resource is actually gone.
    pub fn deletes_asynchronously(self) -> bool {
        matches!(
            self,
            Self::AutoScalingGroup | Self::Ec2Instance | Self::LoadBalancer | Self::NatGateway
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AutoScalingGroup => "autoscaling-group",
            Self::Ec2Instance => "ec2-instance",
            Self::LoadBalancer => "load-balancer",
            Self::TargetGroup => "target-group",
            Self::NatGateway => "nat-gateway",
            Self::Certificate => "certificate",
            Self::KeyPair => "key-pair",
            Self::Secret => "secret",
            Self::IamInstanceProfile => "iam-instance-profile",
            Self::IamRole => "iam-role",
            Self::ElasticIp => "elastic-ip",
            Self::InternetGateway => "internet-gateway",
            Self::SecurityGroup => "security-group",
            Self::RouteTable => "route-table",
            Self::Subnet => "subnet",
            Self::Vpc => "vpc",
            Self::S3Bucket => "s3-bucket",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A resource discovered by tag, independent of any state document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaggedResource {
    pub kind: ResourceKind,
    /// Identifier the delete call expects (instance id, role name, ARN, ...)
    pub id: String,
    /// Original ARN or name as reported by the provider
    pub arn: String,
}

impl fmt::Display for TaggedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

// ============================================================================
// Journal events
// ============================================================================

/// Workflow event for the JSONL journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow: String,
        environment: String,
        run_id: String,
        stackhand_version: String,
    },
    StepCompleted {
        workflow: String,
        step: String,
        attempts: u32,
    },
    StepFailed {
        workflow: String,
        step: String,
        error: String,
    },
    TeardownTransition {
        from: String,
        to: String,
    },
    ResourceDeleted {
        kind: ResourceKind,
        id: String,
    },
    ResourceAlreadyGone {
        kind: ResourceKind,
        id: String,
    },
    ResourceDeleteFailed {
        kind: ResourceKind,
        id: String,
        error: String,
    },
    ResourceSkipped {
        kind: ResourceKind,
        id: String,
        reason: String,
    },
    StateBackedUp {
        path: String,
        bytes: u64,
        hash: String,
    },
    WorkflowCompleted {
        workflow: String,
        run_id: String,
        ok: bool,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: WorkflowEvent,
}

// ============================================================================
// Tests
// ============================================================================
