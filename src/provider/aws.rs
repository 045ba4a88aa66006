//! SH-032: AWS CLI provider.
//!
//! Every call is `aws <service> <operation> ... --output json`, with
//! `--region`/`--profile` appended only when configured so the CLI's own
//! environment and config files keep working. Failures are classified from
//! stderr: not-found answers become `StackError::NotFound`, credential and
//! permission problems become preconditions, everything else is a retryable
//! provider error.

use super::{arn, CloudProvider, TagListing};
use crate::core::error::StackError;
use crate::core::types::{ResourceKind, Tag, TaggedResource};
use crate::transport::{self, CommandSpec, ExecOutput};
use indexmap::IndexMap;
use serde_json::{json, Value};

/// `delete-objects` accepts at most this many keys per call.
const DELETE_BATCH: usize = 1000;

const NOT_FOUND_MARKERS: &[&str] = &[
    "NotFound",
    "Not Found",
    "NoSuchEntity",
    "NoSuchBucket",
    "ResourceNotFoundException",
    "does not exist",
    "InvalidAllocationID",
];

const CREDENTIAL_MARKERS: &[&str] = &[
    "Unable to locate credentials",
    "ExpiredToken",
    "InvalidClientTokenId",
    "could not be found in the config",
    "The config profile",
];

const PERMISSION_MARKERS: &[&str] = &[
    "AccessDenied",
    "UnauthorizedOperation",
    "is not authorized to perform",
];

pub struct AwsCli {
    binary: String,
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new(region: Option<&str>, profile: Option<&str>) -> Self {
        Self {
            binary: "aws".to_string(),
            region: region.map(str::to_string),
            profile: profile.map(str::to_string),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command(&self, service: &str, operation: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.binary)
            .args([service, operation])
            .env("AWS_PAGER", "");
        if let Some(ref region) = self.region {
            spec = spec.args(["--region", region.as_str()]);
        }
        if let Some(ref profile) = self.profile {
            spec = spec.args(["--profile", profile.as_str()]);
        }
        spec
    }

    fn call<I, S>(&self, service: &str, operation: &str, args: I) -> Result<ExecOutput, StackError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self
            .command(service, operation)
            .args(args)
            .args(["--output", "json"]);
        let out = transport::run(&spec)
            .map_err(|e| StackError::Precondition(format!("cannot run {}: {}", self.binary, e)))?;
        if out.success() {
            Ok(out)
        } else {
            Err(classify_failure(operation, &out))
        }
    }

    fn call_json<I, S>(&self, service: &str, operation: &str, args: I) -> Result<Value, StackError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let out = self.call(service, operation, args)?;
        parse_json(operation, &out.stdout)
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    fn tagged_via_tagging_api(&self, tag: &Tag) -> Result<Vec<TaggedResource>, StackError> {
        let filter = format!("Key={},Values={}", tag.key, tag.value);
        let v = self.call_json(
            "resourcegroupstaggingapi",
            "get-resources",
            ["--tag-filters", filter.as_str()],
        )?;
        Ok(strings_at(&v, "ResourceTagMappingList", "ResourceARN")
            .iter()
            .map(|a| arn::classify(a))
            .collect())
    }

    fn tagged_auto_scaling_groups(&self, tag: &Tag) -> Result<Vec<TaggedResource>, StackError> {
        let filter = format!("Name=tag:{},Values={}", tag.key, tag.value);
        let v = self.call_json(
            "autoscaling",
            "describe-auto-scaling-groups",
            ["--filters", filter.as_str()],
        )?;
        let groups = v
            .get("AutoScalingGroups")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(groups
            .iter()
            .filter_map(|g| {
                let name = g.get("AutoScalingGroupName")?.as_str()?;
                let arn = g
                    .get("AutoScalingGroupARN")
                    .and_then(Value::as_str)
                    .unwrap_or(name);
                Some(TaggedResource {
                    kind: ResourceKind::AutoScalingGroup,
                    id: name.to_string(),
                    arn: arn.to_string(),
                })
            })
            .collect())
    }

    /// Tags of one IAM entity. `None` when it vanished between the listing
    /// and the tag lookup.
    fn iam_tags(&self, operation: &str, flag: &str, name: &str) -> Result<Option<Value>, StackError> {
        match self.call_json("iam", operation, [flag, name]) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// IAM is global and not covered by the tagging API; roles are listed
    /// and their tags read one by one.
    fn tagged_iam_roles(&self, tag: &Tag) -> Result<Vec<TaggedResource>, StackError> {
        let mut found = Vec::new();
        let roles = self.call_json("iam", "list-roles", Vec::<String>::new())?;
        for role in roles.get("Roles").and_then(Value::as_array).into_iter().flatten() {
            let (Some(name), Some(arn)) = (
                role.get("RoleName").and_then(Value::as_str),
                role.get("Arn").and_then(Value::as_str),
            ) else {
                continue;
            };
            let path = role.get("Path").and_then(Value::as_str).unwrap_or("/");
            if path.starts_with("/aws-service-role/") {
                continue;
            }
            let Some(tags) = self.iam_tags("list-role-tags", "--role-name", name)? else {
                continue;
            };
            if has_tag(&tags, tag) {
                found.push(TaggedResource {
                    kind: ResourceKind::IamRole,
                    id: name.to_string(),
                    arn: arn.to_string(),
                });
            }
        }
        Ok(found)
    }

    fn tagged_iam_instance_profiles(&self, tag: &Tag) -> Result<Vec<TaggedResource>, StackError> {
        let mut found = Vec::new();
        let profiles = self.call_json("iam", "list-instance-profiles", Vec::<String>::new())?;
        for profile in profiles
            .get("InstanceProfiles")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let (Some(name), Some(arn)) = (
                profile.get("InstanceProfileName").and_then(Value::as_str),
                profile.get("Arn").and_then(Value::as_str),
            ) else {
                continue;
            };
            let Some(tags) = self.iam_tags(
                "list-instance-profile-tags",
                "--instance-profile-name",
                name,
            )?
            else {
                continue;
            };
            if has_tag(&tags, tag) {
                found.push(TaggedResource {
                    kind: ResourceKind::IamInstanceProfile,
                    id: name.to_string(),
                    arn: arn.to_string(),
                });
            }
        }
        Ok(found)
    }

    // ------------------------------------------------------------------
    // Deletion with detach steps
    // ------------------------------------------------------------------

    fn delete_iam_role(&self, role: &str) -> Result<(), StackError> {
        let profiles = self.call_json(
            "iam",
            "list-instance-profiles-for-role",
            ["--role-name", role],
        )?;
        for name in strings_at(&profiles, "InstanceProfiles", "InstanceProfileName") {
            self.call(
                "iam",
                "remove-role-from-instance-profile",
                ["--instance-profile-name", name.as_str(), "--role-name", role],
            )?;
        }

        let attached = self.call_json("iam", "list-attached-role-policies", ["--role-name", role])?;
        for policy_arn in strings_at(&attached, "AttachedPolicies", "PolicyArn") {
            self.call(
                "iam",
                "detach-role-policy",
                ["--role-name", role, "--policy-arn", policy_arn.as_str()],
            )?;
        }

        let inline = self.call_json("iam", "list-role-policies", ["--role-name", role])?;
        for policy in inline
            .get("PolicyNames")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
        {
            self.call(
                "iam",
                "delete-role-policy",
                ["--role-name", role, "--policy-name", policy],
            )?;
        }

        self.call("iam", "delete-role", ["--role-name", role])
            .map(|_| ())
    }

    fn delete_instance_profile(&self, name: &str) -> Result<(), StackError> {
        let v = self.call_json(
            "iam",
            "get-instance-profile",
            ["--instance-profile-name", name],
        )?;
        let roles = v
            .pointer("/InstanceProfile/Roles")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for role in roles.iter().filter_map(|r| r.get("RoleName")?.as_str()) {
            self.call(
                "iam",
                "remove-role-from-instance-profile",
                ["--instance-profile-name", name, "--role-name", role],
            )?;
        }
        self.call(
            "iam",
            "delete-instance-profile",
            ["--instance-profile-name", name],
        )
        .map(|_| ())
    }

    fn delete_internet_gateway(&self, igw: &str) -> Result<(), StackError> {
        let v = self.call_json(
            "ec2",
            "describe-internet-gateways",
            ["--internet-gateway-ids", igw],
        )?;
        let vpcs: Vec<String> = v
            .get("InternetGateways")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .flat_map(|g| strings_at(g, "Attachments", "VpcId"))
            .collect();
        for vpc in &vpcs {
            self.call(
                "ec2",
                "detach-internet-gateway",
                ["--internet-gateway-id", igw, "--vpc-id", vpc.as_str()],
            )?;
        }
        self.call("ec2", "delete-internet-gateway", ["--internet-gateway-id", igw])
            .map(|_| ())
    }

    /// Main route tables cannot be deleted on their own; they go with the VPC.
    fn delete_route_table(&self, rtb: &str) -> Result<(), StackError> {
        let v = self.call_json("ec2", "describe-route-tables", ["--route-table-ids", rtb])?;
        let associations: Vec<Value> = v
            .get("RouteTables")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|t| t.get("Associations").and_then(Value::as_array))
            .flatten()
            .cloned()
            .collect();
        if associations
            .iter()
            .any(|a| a.get("Main").and_then(Value::as_bool) == Some(true))
        {
            return Ok(());
        }
        for id in associations
            .iter()
            .filter_map(|a| a.get("RouteTableAssociationId")?.as_str())
        {
            self.call("ec2", "disassociate-route-table", ["--association-id", id])?;
        }
        self.call("ec2", "delete-route-table", ["--route-table-id", rtb])
            .map(|_| ())
    }

    fn empty_bucket(&self, bucket: &str) -> Result<(), StackError> {
        let v = self.call_json("s3api", "list-object-versions", ["--bucket", bucket])?;
        let objects = object_versions(&v);
        for batch in objects.chunks(DELETE_BATCH) {
            let payload = json!({ "Objects": batch, "Quiet": true }).to_string();
            self.call(
                "s3api",
                "delete-objects",
                ["--bucket", bucket, "--delete", payload.as_str()],
            )?;
        }
        Ok(())
    }
}

/// Combine per-source discovery results. ASGs can show up both in the
/// tagging API and in the autoscaling query, so entries are deduplicated by
/// kind and id. Fails only when every source failed.
pub fn merge_sources(
    results: Vec<(&str, Result<Vec<TaggedResource>, StackError>)>,
) -> Result<TagListing, StackError> {
    let sources = results.len();
    let mut by_key: IndexMap<(ResourceKind, String), TaggedResource> = IndexMap::new();
    let mut failures = Vec::new();
    let mut first_error = None;
    for (source, result) in results {
        match result {
            Ok(batch) => {
                for r in batch {
                    by_key.entry((r.kind, r.id.clone())).or_insert(r);
                }
            }
            Err(e) => {
                failures.push((source.to_string(), e.to_string()));
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) if failures.len() == sources => Err(e),
        _ => Ok(TagListing {
            resources: by_key.into_values().collect(),
            failures,
        }),
    }
}

/// Turn a failed CLI call into the error taxonomy.
pub fn classify_failure(operation: &str, out: &ExecOutput) -> StackError {
    let text = if out.stderr.trim().is_empty() {
        &out.stdout
    } else {
        &out.stderr
    };
    if NOT_FOUND_MARKERS.iter().any(|m| text.contains(m)) {
        return StackError::NotFound(format!("{}: {}", operation, out.error_summary()));
    }
    if CREDENTIAL_MARKERS.iter().any(|m| text.contains(m)) {
        return StackError::Precondition(format!(
            "AWS credentials unusable ({}): {}",
            operation,
            out.error_summary()
        ));
    }
    if PERMISSION_MARKERS.iter().any(|m| text.contains(m)) {
        return StackError::Precondition(format!(
            "permission denied ({}): {}",
            operation,
            out.error_summary()
        ));
    }
    StackError::provider(operation, out.error_summary())
}

fn parse_json(operation: &str, stdout: &str) -> Result<Value, StackError> {
    if stdout.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(stdout)
        .map_err(|e| StackError::provider(operation, format!("unparseable response: {}", e)))
}

/// Collect `v[list][*][field]` strings.
fn strings_at(v: &Value, list: &str, field: &str) -> Vec<String> {
    v.get(list)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get(field)?.as_str().map(str::to_string))
        .collect()
}

/// Whether a `{"Tags": [{"Key", "Value"}]}` response carries `tag`.
fn has_tag(v: &Value, tag: &Tag) -> bool {
    v.get("Tags")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .any(|t| {
            t.get("Key").and_then(Value::as_str) == Some(tag.key.as_str())
                && t.get("Value").and_then(Value::as_str) == Some(tag.value.as_str())
        })
}

/// `{Key, VersionId}` pairs for every version and delete marker.
fn object_versions(v: &Value) -> Vec<Value> {
    ["Versions", "DeleteMarkers"]
        .iter()
        .filter_map(|list| v.get(*list).and_then(Value::as_array))
        .flatten()
        .filter_map(|o| {
            let key = o.get("Key")?.as_str()?;
            let version = o.get("VersionId").and_then(Value::as_str).unwrap_or("null");
            Some(json!({ "Key": key, "VersionId": version }))
        })
        .collect()
}

/// `put-bucket-tagging` payload.
pub fn tagging_payload(tags: &IndexMap<String, String>) -> String {
    let set: Vec<Value> = tags
        .iter()
        .map(|(k, v)| json!({ "Key": k, "Value": v }))
        .collect();
    json!({ "TagSet": set }).to_string()
}

/// `create-bucket` arguments. `us-east-1` rejects an explicit location constraint.
pub fn create_bucket_args(bucket: &str, region: &str) -> Vec<String> {
    let mut args = vec!["--bucket".to_string(), bucket.to_string()];
    if region != "us-east-1" {
        args.push("--create-bucket-configuration".to_string());
        args.push(format!("LocationConstraint={}", region));
    }
    args
}

impl CloudProvider for AwsCli {
    fn check_available(&self) -> Result<(), StackError> {
        if transport::tool_available(&self.binary) {
            Ok(())
        } else {
            Err(StackError::Precondition(format!(
                "{} not found on PATH",
                self.binary
            )))
        }
    }

    fn caller_identity(&self) -> Result<String, StackError> {
        let v = self
            .call_json("sts", "get-caller-identity", Vec::<String>::new())
            .map_err(|e| match e {
                StackError::Provider { message, .. } => {
                    StackError::Precondition(format!("AWS credentials unusable: {}", message))
                }
                other => other,
            })?;
        Ok(v.get("Arn")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    fn bucket_exists(&self, bucket: &str) -> Result<bool, StackError> {
        match self.call("s3api", "head-bucket", ["--bucket", bucket]) {
            Ok(_) => Ok(true),
            Err(StackError::NotFound(_)) => Ok(false),
            Err(StackError::Provider { message, .. })
                if message.contains("403") || message.contains("Forbidden") =>
            {
                Err(StackError::Precondition(format!(
                    "bucket {} exists but is not accessible with these credentials",
                    bucket
                )))
            }
            Err(e) => Err(e),
        }
    }

    fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), StackError> {
        match self.call("s3api", "create-bucket", create_bucket_args(bucket, region)) {
            Ok(_) => Ok(()),
            Err(StackError::Provider { message, .. })
                if message.contains("BucketAlreadyOwnedByYou") =>
            {
                Ok(())
            }
            Err(StackError::Provider { message, .. })
                if message.contains("BucketAlreadyExists") =>
            {
                Err(StackError::Precondition(format!(
                    "bucket name {} is taken by another account",
                    bucket
                )))
            }
            Err(e) => Err(e),
        }
    }

    fn enable_versioning(&self, bucket: &str) -> Result<(), StackError> {
        self.call(
            "s3api",
            "put-bucket-versioning",
            [
                "--bucket",
                bucket,
                "--versioning-configuration",
                "Status=Enabled",
            ],
        )
        .map(|_| ())
    }

    fn block_public_access(&self, bucket: &str) -> Result<(), StackError> {
        self.call(
            "s3api",
            "put-public-access-block",
            [
                "--bucket",
                bucket,
                "--public-access-block-configuration",
                "BlockPublicAcls=true,IgnorePublicAcls=true,BlockPublicPolicy=true,RestrictPublicBuckets=true",
            ],
        )
        .map(|_| ())
    }

    fn tag_bucket(&self, bucket: &str, tags: &IndexMap<String, String>) -> Result<(), StackError> {
        let payload = tagging_payload(tags);
        self.call(
            "s3api",
            "put-bucket-tagging",
            ["--bucket", bucket, "--tagging", payload.as_str()],
        )
        .map(|_| ())
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), StackError> {
        self.empty_bucket(bucket)?;
        self.call("s3api", "delete-bucket", ["--bucket", bucket])
            .map(|_| ())
    }

    fn list_tagged(&self, tag: &Tag) -> Result<TagListing, StackError> {
        merge_sources(vec![
            ("tagging-api", self.tagged_via_tagging_api(tag)),
            ("auto-scaling", self.tagged_auto_scaling_groups(tag)),
            ("iam-roles", self.tagged_iam_roles(tag)),
            ("iam-instance-profiles", self.tagged_iam_instance_profiles(tag)),
        ])
    }

    fn delete_resource(&self, r: &TaggedResource) -> Result<(), StackError> {
        let id = r.id.as_str();
        let result = match r.kind {
            ResourceKind::AutoScalingGroup => self.call(
                "autoscaling",
                "delete-auto-scaling-group",
                ["--auto-scaling-group-name", id, "--force-delete"],
            ),
            ResourceKind::Ec2Instance => {
                self.call("ec2", "terminate-instances", ["--instance-ids", id])
            }
            ResourceKind::LoadBalancer => {
                self.call("elbv2", "delete-load-balancer", ["--load-balancer-arn", id])
            }
            ResourceKind::TargetGroup => {
                self.call("elbv2", "delete-target-group", ["--target-group-arn", id])
            }
            ResourceKind::NatGateway => {
                self.call("ec2", "delete-nat-gateway", ["--nat-gateway-id", id])
            }
            ResourceKind::Certificate => {
                self.call("acm", "delete-certificate", ["--certificate-arn", id])
            }
            ResourceKind::KeyPair => self.call("ec2", "delete-key-pair", ["--key-pair-id", id]),
            ResourceKind::Secret => self.call(
                "secretsmanager",
                "delete-secret",
                ["--secret-id", id, "--force-delete-without-recovery"],
            ),
            ResourceKind::IamInstanceProfile => return self.delete_instance_profile(id),
            ResourceKind::IamRole => return self.delete_iam_role(id),
            ResourceKind::ElasticIp => {
                self.call("ec2", "release-address", ["--allocation-id", id])
            }
            ResourceKind::InternetGateway => return self.delete_internet_gateway(id),
            ResourceKind::SecurityGroup => {
                self.call("ec2", "delete-security-group", ["--group-id", id])
            }
            ResourceKind::RouteTable => return self.delete_route_table(id),
            ResourceKind::Subnet => self.call("ec2", "delete-subnet", ["--subnet-id", id]),
            ResourceKind::Vpc => self.call("ec2", "delete-vpc", ["--vpc-id", id]),
            ResourceKind::S3Bucket => return self.delete_bucket(id),
            ResourceKind::Unknown => {
                return Err(StackError::provider(
                    "delete",
                    format!("no delete operation for {}", r.arn),
                ))
            }
        };
        result.map(|_| ())
    }
}
