//! SH-031: ARN classification for tag-based discovery.
//!
//! The tagging API answers with bare ARNs. Each is mapped to a
//! `ResourceKind` and the identifier the matching delete call expects.

use crate::core::types::{ResourceKind, TaggedResource};

/// Classify an ARN. Unrecognized ARNs come back as `ResourceKind::Unknown`.
pub fn classify(arn: &str) -> TaggedResource {
    let unknown = || TaggedResource {
        kind: ResourceKind::Unknown,
        id: arn.to_string(),
        arn: arn.to_string(),
    };

    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    if parts.len() != 6 || parts[0] != "arn" {
        return unknown();
    }
    let service = parts[2];
    let resource = parts[5];

    let (kind, id) = match service {
        "ec2" => {
            let Some((rtype, rid)) = resource.split_once('/') else {
                return unknown();
            };
            let kind = match rtype {
                "instance" => ResourceKind::Ec2Instance,
                "natgateway" => ResourceKind::NatGateway,
                "vpc" => ResourceKind::Vpc,
                "subnet" => ResourceKind::Subnet,
                "security-group" => ResourceKind::SecurityGroup,
                "internet-gateway" => ResourceKind::InternetGateway,
                "route-table" => ResourceKind::RouteTable,
                "elastic-ip" => ResourceKind::ElasticIp,
                "key-pair" => ResourceKind::KeyPair,
                _ => return unknown(),
            };
            (kind, rid.to_string())
        }
        "elasticloadbalancing" => {
            if resource.starts_with("loadbalancer/") {
                (ResourceKind::LoadBalancer, arn.to_string())
            } else if resource.starts_with("targetgroup/") {
                (ResourceKind::TargetGroup, arn.to_string())
            } else {
                return unknown();
            }
        }
        "s3" if !resource.is_empty() && !resource.contains('/') => {
            (ResourceKind::S3Bucket, resource.to_string())
        }
        "acm" if resource.starts_with("certificate/") => {
            (ResourceKind::Certificate, arn.to_string())
        }
        "secretsmanager" if resource.starts_with("secret:") => {
            (ResourceKind::Secret, arn.to_string())
        }
        "iam" => {
            let Some((rtype, path)) = resource.split_once('/') else {
                return unknown();
            };
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            match rtype {
                "role" => (ResourceKind::IamRole, name),
                "instance-profile" => (ResourceKind::IamInstanceProfile, name),
                _ => return unknown(),
            }
        }
        "autoscaling" => match resource.split_once("autoScalingGroupName/") {
            Some((_, name)) if !name.is_empty() => {
                (ResourceKind::AutoScalingGroup, name.to_string())
            }
            _ => return unknown(),
        },
        _ => return unknown(),
    };

    TaggedResource {
        kind,
        id,
        arn: arn.to_string(),
    }
}
