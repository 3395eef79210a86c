//! Typed views over the open `spec` mapping, one per kind.
//!
//! Required fields are plain (non-`Option`) fields, so decoding a resource
//! that lacks one fails with [`CoreError::InvalidSpec`]. Unknown keys are
//! ignored and survive a decode/encode cycle only through the raw mapping.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::resource::{Kind, Resource};

/// A spec struct bound to exactly one kind.
pub trait KindSpec: Serialize + DeserializeOwned {
    const KIND: Kind;

    /// Decode this spec from a resource of the matching kind.
    fn decode(resource: &Resource) -> CoreResult<Self> {
        if resource.kind != Self::KIND {
            return Err(CoreError::KindMismatch {
                expected: Self::KIND.to_string(),
                actual: resource.kind.to_string(),
                name: resource.name_hash_key.clone(),
            });
        }
        serde_json::from_value(Value::Object(resource.spec.clone())).map_err(|e| {
            CoreError::InvalidSpec {
                kind: Self::KIND.to_string(),
                name: resource.name_hash_key.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Build a resource named `name` carrying this spec.
    fn into_resource(&self, name: &str) -> CoreResult<Resource> {
        let spec = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(CoreError::InvalidSpec {
                    kind: Self::KIND.to_string(),
                    name: name.to_string(),
                    reason: format!("spec must encode to a mapping, got {other}"),
                });
            }
            Err(e) => {
                return Err(CoreError::InvalidSpec {
                    kind: Self::KIND.to_string(),
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        Ok(Resource::new(Self::KIND, name, spec))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {}

impl KindSpec for ProjectSpec {
    const KIND: Kind = Kind::Project;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub project: String,
}

impl KindSpec for ApplicationSpec {
    const KIND: Kind = Kind::Application;
}

/// A deployment request for one application at one content version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub project: String,
    pub app: String,
    /// Content version; empty when the writer did not supply one.
    #[serde(default)]
    pub sha1: String,
}

impl KindSpec for DeploymentSpec {
    const KIND: Kind = Kind::Deployment;
}

/// The desired version of a deployment on one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSpec {
    pub project: String,
    pub app: String,
    #[serde(default)]
    pub sha1: String,
    pub cluster: String,
}

impl KindSpec for ReleaseSpec {
    const KIND: Kind = Kind::Release;
}

impl ReleaseSpec {
    /// `<deployment-name>-<cluster-name>`: one release per pair.
    pub fn release_name(deployment: &str, cluster: &str) -> String {
        format!("{deployment}-{cluster}")
    }
}

/// Lifecycle phase of an install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPhase {
    Pending,
    Running,
    Completed,
    Failed,
}

impl InstallPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallPhase::Pending => "pending",
            InstallPhase::Running => "running",
            InstallPhase::Completed => "completed",
            InstallPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a release at one content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSpec {
    pub project: String,
    pub app: String,
    #[serde(default)]
    pub sha1: String,
    pub cluster: String,
    pub phase: InstallPhase,
    /// Unix timestamp (seconds) of the transition to `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

impl KindSpec for InstallSpec {
    const KIND: Kind = Kind::Install;
}

impl InstallSpec {
    /// `<release-name>-<sha1>`: installs are append-only per content hash.
    pub fn install_name(release: &str, sha1: &str) -> String {
        format!("{release}-{sha1}")
    }
}

/// The placement fields of an install, readable whatever its phase says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallTarget {
    pub project: String,
    pub app: String,
    pub cluster: String,
}

impl KindSpec for InstallTarget {
    const KIND: Kind = Kind::Install;
}

/// Spec of a kind definition. Definitions carry no required fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSpec {}

impl KindSpec for DefinitionSpec {
    const KIND: Kind = Kind::CustomResourceDefinition;
}

/// A resource spec decoded according to its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedSpec {
    Project(ProjectSpec),
    Application(ApplicationSpec),
    Deployment(DeploymentSpec),
    Release(ReleaseSpec),
    Install(InstallSpec),
    CustomResourceDefinition(DefinitionSpec),
}

impl TypedSpec {
    pub fn decode(resource: &Resource) -> CoreResult<Self> {
        Ok(match resource.kind {
            Kind::Project => TypedSpec::Project(ProjectSpec::decode(resource)?),
            Kind::Application => TypedSpec::Application(ApplicationSpec::decode(resource)?),
            Kind::Deployment => TypedSpec::Deployment(DeploymentSpec::decode(resource)?),
            Kind::Release => TypedSpec::Release(ReleaseSpec::decode(resource)?),
            Kind::Install => TypedSpec::Install(InstallSpec::decode(resource)?),
            Kind::CustomResourceDefinition => {
                TypedSpec::CustomResourceDefinition(DefinitionSpec::decode(resource)?)
            }
        })
    }
}

/// Merge a typed spec back into a resource, keeping any extra keys the
/// typed view does not know about.
pub fn merge_spec<S: KindSpec>(resource: &mut Resource, spec: &S) -> CoreResult<()> {
    let encoded = spec.into_resource(&resource.name_hash_key)?.spec;
    let mut merged: Map<String, Value> = resource.spec.clone();
    for (k, v) in encoded {
        merged.insert(k, v);
    }
    resource.spec = merged;
    Ok(())
}
