//! The generic resource entity and its identity scheme.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// Name and labels of a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl Metadata {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            labels: HashMap::new(),
        }
    }
}

/// The fixed set of resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Project,
    Application,
    Deployment,
    Release,
    Install,
    CustomResourceDefinition,
}

impl Kind {
    pub const ALL: [Kind; 6] = [
        Kind::Project,
        Kind::Application,
        Kind::Deployment,
        Kind::Release,
        Kind::Install,
        Kind::CustomResourceDefinition,
    ];

    /// Lowercase resource name, used in table and log group names.
    pub fn resource_name(self) -> &'static str {
        match self {
            Kind::Project => "project",
            Kind::Application => "application",
            Kind::Deployment => "deployment",
            Kind::Release => "release",
            Kind::Install => "install",
            Kind::CustomResourceDefinition => "customresourcedefinition",
        }
    }

    /// Kind definitions live in one global table; everything else is
    /// partitioned by namespace.
    pub fn is_namespaced(self) -> bool {
        self != Kind::CustomResourceDefinition
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_name())
    }
}

impl FromStr for Kind {
    type Err = CoreError;

    /// Accepts the resource name (`deployment`), its plural (`deployments`),
    /// the kind name (`Deployment`) and `crd`/`crds`.
    fn from_str(s: &str) -> CoreResult<Self> {
        let lower = s.to_ascii_lowercase();
        if lower == "crd" || lower == "crds" {
            return Ok(Kind::CustomResourceDefinition);
        }
        let singular = lower.strip_suffix('s').unwrap_or(&lower);
        Kind::ALL
            .into_iter()
            .find(|k| k.resource_name() == lower || k.resource_name() == singular)
            .ok_or_else(|| CoreError::UnknownKind(s.to_string()))
    }
}

/// The universal entity stored in every resource table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Primary key, unique within (namespace, kind).
    pub name_hash_key: String,
    pub metadata: Metadata,
    pub kind: Kind,
    #[serde(default)]
    pub spec: Map<String, Value>,
}

impl Resource {
    /// Build a resource whose key and metadata name are both `name`.
    pub fn new(kind: Kind, name: &str, spec: Map<String, Value>) -> Self {
        Self {
            name_hash_key: name.to_string(),
            metadata: Metadata::named(name),
            kind,
            spec,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.metadata.labels
    }

    /// Read a string field from the spec, if present.
    pub fn spec_str(&self, key: &str) -> Option<&str> {
        self.spec.get(key).and_then(Value::as_str)
    }
}

/// Describes a resource kind for table provisioning. Identified by
/// `metadata.name`, the kind's resource name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomResourceDefinition {
    pub metadata: Metadata,
}

impl CustomResourceDefinition {
    pub fn for_kind(kind: Kind) -> Self {
        Self {
            metadata: Metadata::named(kind.resource_name()),
        }
    }

    /// The kind this definition provisions, if it names a known one.
    pub fn kind(&self) -> Option<Kind> {
        self.metadata.name.parse().ok()
    }

    pub fn to_resource(&self) -> Resource {
        Resource {
            name_hash_key: self.metadata.name.clone(),
            metadata: self.metadata.clone(),
            kind: Kind::CustomResourceDefinition,
            spec: Map::new(),
        }
    }

    pub fn from_resource(resource: &Resource) -> Self {
        Self {
            metadata: resource.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_names_plurals_and_kind_names() {
        assert_eq!("deployment".parse::<Kind>().unwrap(), Kind::Deployment);
        assert_eq!("deployments".parse::<Kind>().unwrap(), Kind::Deployment);
        assert_eq!("Release".parse::<Kind>().unwrap(), Kind::Release);
        assert_eq!("installs".parse::<Kind>().unwrap(), Kind::Install);
        assert_eq!("crd".parse::<Kind>().unwrap(), Kind::CustomResourceDefinition);
        assert_eq!(
            "customresourcedefinitions".parse::<Kind>().unwrap(),
            Kind::CustomResourceDefinition
        );
        assert!(matches!(
            "widget".parse::<Kind>(),
            Err(CoreError::UnknownKind(_))
        ));
    }

    #[test]
    fn only_definitions_are_global() {
        for kind in Kind::ALL {
            assert_eq!(kind.is_namespaced(), kind != Kind::CustomResourceDefinition);
        }
    }

    #[test]
    fn resource_json_shape() {
        let mut spec = Map::new();
        spec.insert("project".into(), Value::from("myproj"));
        let r = Resource::new(Kind::Application, "app1", spec).with_label("tier", "web");

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["name_hash_key"], "app1");
        assert_eq!(json["metadata"]["name"], "app1");
        assert_eq!(json["metadata"]["labels"]["tier"], "web");
        assert_eq!(json["kind"], "Application");
        assert_eq!(json["spec"]["project"], "myproj");
        assert_eq!(r.spec_str("project"), Some("myproj"));
    }

    #[test]
    fn crd_knows_its_kind() {
        let crd = CustomResourceDefinition::for_kind(Kind::Install);
        assert_eq!(crd.kind(), Some(Kind::Install));
        let r = crd.to_resource();
        assert_eq!(r.kind, Kind::CustomResourceDefinition);
        assert_eq!(r.name_hash_key, "install");
        assert_eq!(CustomResourceDefinition::from_resource(&r), crd);
    }
}
