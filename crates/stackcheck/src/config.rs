//! Rule configuration
//!
//! Provider knowledge (which types hold data, which property carries a name, which ports speak a
//! data-plane protocol, ...) lives in a YAML document rather than in code. A built-in catalog is
//! embedded; `--rules <file>` replaces it.
use crate::util::FieldPath;
use indexmap::IndexMap;
use std::path::Path;

const BUILTIN_RULES: &str = include_str!("default_rules.yaml");

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Environment class used when the run does not name one
    pub default_environment_class: String,
    #[serde(default)]
    pub resource_types: IndexMap<String, ResourceTypeSpec>,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub encryption: EncryptionSettings,
    #[serde(default)]
    pub tagging: TaggingSettings,
    /// Rule names that are not evaluated
    #[serde(default)]
    pub disabled_rules: Vec<String>,
}

/// What the rules know about one provider resource type
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceTypeSpec {
    /// Holds durable data or credentials
    pub stateful: bool,
    /// Property carrying the externally visible name
    pub name_property: Option<String>,
    /// Property a `Ref` to this resource returns, when it is not provider assigned
    pub ref_property: Option<String>,
    /// Attributes that are a static pass-through of a property (attribute -> property path)
    pub attributes: IndexMap<String, FieldPath>,
    pub encryption: Option<EncryptionSpec>,
    pub ingress: Option<IngressSpec>,
    /// Receives public traffic (load balancers, CDN origins)
    pub front_door: bool,
    pub taggable: bool,
    /// Extra fields compared against live state
    pub live_fields: Vec<FieldPath>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionSpec {
    /// Any of these being set (and not `false`) counts as encrypted
    pub key_paths: Vec<FieldPath>,
}

/// Where ingress rules live on a network access control resource
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IngressSpec {
    /// List property of rules on the group itself
    pub rules_property: Option<String>,
    /// The resource is a single rule; this property names the group it belongs to
    pub group_property: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LifecycleSettings {
    /// environment class -> allowed deletion policies
    pub allowed_policies: IndexMap<String, Vec<String>>,
    /// Logical ids exempt from the deletion-policy rule
    pub exemptions: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetworkSettings {
    pub data_plane_ports: Vec<PortSpec>,
    /// Ports that may be open to the world on a front door
    pub public_ports: Vec<u16>,
    pub cidr_properties: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EncryptionSettings {
    /// tag key -> values marking classified data (empty: any value)
    pub classified_tags: IndexMap<String, Vec<String>>,
    pub classified_severity: crate::rules::Severity,
    pub default_severity: crate::rules::Severity,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            classified_tags: Default::default(),
            classified_severity: crate::rules::Severity::High,
            default_severity: crate::rules::Severity::Medium,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TaggingSettings {
    pub required: Vec<String>,
}

impl RuleConfig {
    /// The embedded catalog
    pub fn builtin() -> Self {
        serde_yaml::from_str(BUILTIN_RULES).expect("embedded rule catalog must parse")
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::info!(path=%path.display(), "loading rule configuration");
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn resource_type(&self, resource_type: &str) -> Option<&ResourceTypeSpec> {
        self.resource_types.get(resource_type)
    }

    pub fn is_enabled(&self, rule: &str) -> bool {
        !self.disabled_rules.iter().any(|disabled| disabled == rule)
    }

    pub fn allowed_policies(&self, environment_class: &str) -> Result<&[String], ConfigError> {
        self.lifecycle
            .allowed_policies
            .get(environment_class)
            .map(Vec::as_slice)
            .ok_or_else(|| ConfigError::UnknownEnvironmentClass(environment_class.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.allowed_policies(&self.default_environment_class)?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Unable to parse rule configuration")]
    ParseFailed(#[from] serde_yaml::Error),
    #[error("environment class `{0}` has no deletion policy allow-list")]
    UnknownEnvironmentClass(String),
}
