//! Template loader
//!
//! A [Template] is an arena of [ResourceNode]s indexed by logical id, plus the parameter,
//! mapping, condition and output sections that expressions can refer to. Once built it is never
//! mutated; later stages refer to nodes by [NodeIndex].
//!
//! Accepted formats are JSON, YAML (short-form tags such as `!Ref` are lowered to the long form)
//! and HCL (see [crate::hcl_template]). Declaration order is preserved everywhere.
use crate::error::ParseError;
use crate::expression::Property;
use crate::value::Value;
use indexmap::IndexMap;
use std::marker::PhantomData;
use std::path::Path;

/// Position of a resource in the template arena
pub type NodeIndex = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub id: String,
    pub resource_type: String,
    pub properties: IndexMap<String, Property>,
    /// explicit ordering hints (`DependsOn`)
    pub depends_on: Vec<String>,
    pub deletion_policy: Option<String>,
    pub update_replace_policy: Option<String>,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub parameter_type: String,
    pub default: Option<Value>,
    pub allowed_values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub name: String,
    pub value: Property,
    pub export: Option<Property>,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub format_version: Option<String>,
    pub description: Option<String>,
    pub parameters: IndexMap<String, Parameter>,
    pub mappings: IndexMap<String, Value>,
    pub conditions: IndexMap<String, Property>,
    pub outputs: IndexMap<String, Output>,
    resources: Vec<ResourceNode>,
    index: IndexMap<String, NodeIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Json,
    Yaml,
    Hcl,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(SourceFormat::Json),
            "yaml" | "yml" | "template" => Some(SourceFormat::Yaml),
            "hcl" => Some(SourceFormat::Hcl),
            _ => None,
        }
    }

    /// Guess the format of a document without a file name
    pub fn sniff(text: &str) -> Self {
        let first = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("//"));

        match first {
            Some(line) if line.starts_with('{') => SourceFormat::Json,
            Some(line)
                if ["resource ", "parameter ", "output ", "mapping ", "condition "]
                    .iter()
                    .any(|block| line.starts_with(block)) =>
            {
                SourceFormat::Hcl
            }
            _ => SourceFormat::Yaml,
        }
    }
}

impl Template {
    pub fn parse(text: &str, format: SourceFormat) -> Result<Self, ParseError> {
        match format {
            SourceFormat::Json => Self::from_json_str(text),
            SourceFormat::Yaml => Self::from_yaml_str(text),
            SourceFormat::Hcl => Self::from_hcl_str(text),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ParseError> {
        let raw: RawTemplate<serde_json::Value> =
            serde_json::from_str(text).map_err(|err| ParseError::Syntax {
                message: err.to_string(),
            })?;
        Self::from_raw(raw)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ParseError> {
        let raw: RawTemplate<serde_yaml::Value> =
            serde_yaml::from_str(text).map_err(|err| ParseError::Syntax {
                message: err.to_string(),
            })?;
        Self::from_raw(raw.lower()?)
    }

    pub fn from_hcl_str(text: &str) -> Result<Self, ParseError> {
        Self::from_raw(crate::hcl_template::lower(text)?)
    }

    pub fn load_file(file_path: &Path) -> Result<Self, LoadError> {
        tracing::info!(path=%file_path.display(), "loading file");

        let contents = std::fs::read_to_string(file_path)?;
        let format = SourceFormat::from_path(file_path).unwrap_or_else(|| SourceFormat::sniff(&contents));
        Ok(Self::parse(&contents, format)?)
    }

    pub(crate) fn from_raw(raw: RawTemplate<serde_json::Value>) -> Result<Self, ParseError> {
        let mut template = Template {
            format_version: raw.format_version.as_ref().and_then(text),
            description: raw.description.as_ref().and_then(text),
            parameters: Default::default(),
            mappings: Default::default(),
            conditions: Default::default(),
            outputs: Default::default(),
            resources: Default::default(),
            index: Default::default(),
        };

        for (name, raw) in raw.parameters.0 {
            let path = format!("Parameters.{name}");
            if template.parameters.contains_key(&name) {
                return Err(ParseError::DuplicateLogicalId { path, id: name });
            }
            let parameter = parse_parameter(&name, &raw, &path)?;
            template.parameters.insert(name, parameter);
        }

        for (name, raw) in raw.mappings.0 {
            let path = format!("Mappings.{name}");
            if !raw.is_object() {
                return Err(ParseError::shape(path, "a map of maps"));
            }
            template.mappings.insert(name, raw.into());
        }

        for (name, raw) in raw.conditions.0 {
            let path = format!("Conditions.{name}");
            let condition = Property::parse(&raw, &path)?;
            template.conditions.insert(name, condition);
        }

        for (id, raw) in raw.resources.0 {
            let path = format!("Resources.{id}");
            // parameters and resources share one namespace for `Ref`
            if template.index.contains_key(&id) || template.parameters.contains_key(&id) {
                return Err(ParseError::DuplicateLogicalId { path, id });
            }
            let node = parse_resource(&id, &raw, &path)?;
            template.index.insert(id, template.resources.len());
            template.resources.push(node);
        }

        for (name, raw) in raw.outputs.0 {
            let path = format!("Outputs.{name}");
            let output = parse_output(&name, &raw, &path)?;
            template.outputs.insert(name, output);
        }

        if template.resources.is_empty() {
            return Err(ParseError::NoResources);
        }

        tracing::debug!(
            resources = template.resources.len(),
            parameters = template.parameters.len(),
            outputs = template.outputs.len(),
            "template loaded"
        );

        Ok(template)
    }

    pub fn resources(&self) -> &[ResourceNode] {
        &self.resources
    }

    pub fn resource(&self, index: NodeIndex) -> &ResourceNode {
        &self.resources[index]
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.index_of(id).map(|index| &self.resources[index])
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

fn text(raw: &serde_json::Value) -> Option<String> {
    match raw {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn section(
    object: &serde_json::Map<String, serde_json::Value>,
    key: &str,
    path: &str,
) -> Result<Option<String>, ParseError> {
    match object.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ParseError::shape(format!("{path}.{key}"), "a string")),
    }
}

fn parse_parameter(name: &str, raw: &serde_json::Value, path: &str) -> Result<Parameter, ParseError> {
    let serde_json::Value::Object(object) = raw else {
        return Err(ParseError::shape(path, "a parameter declaration"));
    };

    let allowed_values = match object.get("AllowedValues") {
        None => vec![],
        Some(serde_json::Value::Array(values)) => values.iter().cloned().map(Value::from).collect(),
        Some(_) => return Err(ParseError::shape(format!("{path}.AllowedValues"), "a list")),
    };

    Ok(Parameter {
        name: name.to_string(),
        parameter_type: section(object, "Type", path)?.unwrap_or_else(|| "String".to_string()),
        default: object.get("Default").cloned().map(Value::from),
        allowed_values,
    })
}

fn parse_resource(id: &str, raw: &serde_json::Value, path: &str) -> Result<ResourceNode, ParseError> {
    let serde_json::Value::Object(object) = raw else {
        return Err(ParseError::shape(path, "a resource declaration"));
    };

    let Some(resource_type) = section(object, "Type", path)? else {
        return Err(ParseError::shape(format!("{path}.Type"), "a resource type"));
    };

    let mut properties = IndexMap::new();
    match object.get("Properties") {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::Object(raw_properties)) => {
            for (key, value) in raw_properties {
                let property = Property::parse(value, &format!("{path}.Properties.{key}"))?;
                properties.insert(key.clone(), property);
            }
        }
        Some(_) => return Err(ParseError::shape(format!("{path}.Properties"), "a map")),
    }

    let depends_on = match object.get("DependsOn") {
        None | Some(serde_json::Value::Null) => vec![],
        Some(serde_json::Value::String(target)) => vec![target.clone()],
        Some(serde_json::Value::Array(targets)) => targets
            .iter()
            .enumerate()
            .map(|(index, target)| match target {
                serde_json::Value::String(target) => Ok(target.clone()),
                _ => Err(ParseError::shape(format!("{path}.DependsOn.{index}"), "a logical id")),
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(ParseError::shape(
                format!("{path}.DependsOn"),
                "a logical id or a list of logical ids",
            ))
        }
    };

    Ok(ResourceNode {
        id: id.to_string(),
        resource_type,
        properties,
        depends_on,
        deletion_policy: section(object, "DeletionPolicy", path)?,
        update_replace_policy: section(object, "UpdateReplacePolicy", path)?,
        condition: section(object, "Condition", path)?,
    })
}

fn parse_output(name: &str, raw: &serde_json::Value, path: &str) -> Result<Output, ParseError> {
    let serde_json::Value::Object(object) = raw else {
        return Err(ParseError::shape(path, "an output declaration"));
    };

    let Some(value) = object.get("Value") else {
        return Err(ParseError::shape(format!("{path}.Value"), "an output value"));
    };

    let export = match object.get("Export") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Object(export)) => match export.get("Name") {
            Some(export_name) => Some(Property::parse(export_name, &format!("{path}.Export.Name"))?),
            None => return Err(ParseError::shape(format!("{path}.Export.Name"), "an export name")),
        },
        Some(_) => return Err(ParseError::shape(format!("{path}.Export"), "a map")),
    };

    Ok(Output {
        name: name.to_string(),
        value: Property::parse(value, &format!("{path}.Value"))?,
        export,
        condition: section(object, "Condition", path)?,
    })
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Unable to parse template")]
    ParseFailed(#[from] ParseError),
}

/// Top-level document sections, generic over the parsed value type
///
/// Section entries are kept as ordered pairs (not a map) so duplicate logical ids survive
/// deserialization and can be reported instead of silently overwritten.
#[derive(serde::Deserialize, Debug)]
pub(crate) struct RawTemplate<V> {
    #[serde(rename = "AWSTemplateFormatVersion", default = "Option::default")]
    pub format_version: Option<V>,
    #[serde(rename = "Description", default = "Option::default")]
    pub description: Option<V>,
    #[serde(rename = "Parameters", default)]
    pub parameters: Entries<V>,
    #[serde(rename = "Mappings", default)]
    pub mappings: Entries<V>,
    #[serde(rename = "Conditions", default)]
    pub conditions: Entries<V>,
    #[serde(rename = "Resources", default)]
    pub resources: Entries<V>,
    #[serde(rename = "Outputs", default)]
    pub outputs: Entries<V>,
}

impl<V> Default for RawTemplate<V> {
    fn default() -> Self {
        Self {
            format_version: None,
            description: None,
            parameters: Default::default(),
            mappings: Default::default(),
            conditions: Default::default(),
            resources: Default::default(),
            outputs: Default::default(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Entries<V>(pub Vec<(String, V)>);

impl<V> Default for Entries<V> {
    fn default() -> Self {
        Self(vec![])
    }
}

impl<'de, V: serde::Deserialize<'de>> serde::Deserialize<'de> for Entries<V> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EntriesVisitor<V>(PhantomData<V>);

        impl<'de, V: serde::Deserialize<'de>> serde::de::Visitor<'de> for EntriesVisitor<V> {
            type Value = Entries<V>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a map of named entries")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Entries(vec![]))
            }

            fn visit_none<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Entries(vec![]))
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut entries = vec![];
                while let Some(entry) = access.next_entry::<String, V>()? {
                    entries.push(entry);
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_any(EntriesVisitor(PhantomData))
    }
}

impl RawTemplate<serde_yaml::Value> {
    fn lower(self) -> Result<RawTemplate<serde_json::Value>, ParseError> {
        let lower_entries = |section: &str, entries: Entries<serde_yaml::Value>| {
            entries
                .0
                .into_iter()
                .map(|(key, value)| {
                    let lowered = lower_yaml(value, &format!("{section}.{key}"))?;
                    Ok((key, lowered))
                })
                .collect::<Result<Vec<_>, ParseError>>()
                .map(Entries)
        };

        Ok(RawTemplate {
            format_version: self
                .format_version
                .map(|v| lower_yaml(v, "AWSTemplateFormatVersion"))
                .transpose()?,
            description: self
                .description
                .map(|v| lower_yaml(v, "Description"))
                .transpose()?,
            parameters: lower_entries("Parameters", self.parameters)?,
            mappings: lower_entries("Mappings", self.mappings)?,
            conditions: lower_entries("Conditions", self.conditions)?,
            resources: lower_entries("Resources", self.resources)?,
            outputs: lower_entries("Outputs", self.outputs)?,
        })
    }
}

/// Convert a YAML value into the JSON shape, turning short-form tags into intrinsic objects
///
/// `!Ref X` becomes `{"Ref": "X"}`, `!Sub "..."` becomes `{"Fn::Sub": "..."}` and so on.
fn lower_yaml(value: serde_yaml::Value, path: &str) -> Result<serde_json::Value, ParseError> {
    use serde_yaml::Value as Yaml;

    Ok(match value {
        Yaml::Null => serde_json::Value::Null,
        Yaml::Bool(b) => serde_json::Value::Bool(b),
        Yaml::Number(number) => {
            if let Some(int) = number.as_i64() {
                int.into()
            } else if let Some(int) = number.as_u64() {
                int.into()
            } else {
                number
                    .as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .ok_or_else(|| ParseError::shape(path, "a finite number"))?
            }
        }
        Yaml::String(s) => serde_json::Value::String(s),
        Yaml::Sequence(items) => serde_json::Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(index, item)| lower_yaml(item, &format!("{path}.{index}")))
                .collect::<Result<_, _>>()?,
        ),
        Yaml::Mapping(mapping) => {
            let mut object = serde_json::Map::with_capacity(mapping.len());
            for (key, value) in mapping {
                let key = match key {
                    Yaml::String(key) => key,
                    Yaml::Bool(b) => b.to_string(),
                    Yaml::Number(n) => n.to_string(),
                    _ => return Err(ParseError::shape(path, "scalar map keys")),
                };
                let lowered = lower_yaml(value, &format!("{path}.{key}"))?;
                object.insert(key, lowered);
            }
            serde_json::Value::Object(object)
        }
        Yaml::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            let name = tag.trim_start_matches('!');
            let function = match name {
                "Ref" | "Condition" => name.to_string(),
                other => format!("Fn::{other}"),
            };
            let argument = lower_yaml(tagged.value, &format!("{path}.{function}"))?;

            let mut object = serde_json::Map::with_capacity(1);
            object.insert(function, argument);
            serde_json::Value::Object(object)
        }
    })
}

/// Utility macro to build a [Template] from a YAML literal
///
/// # Panic
/// Panics on invalid input
///
/// ```
/// # use stackcheck::template;
/// let template = template!(r#"
/// Resources:
///   Queue:
///     Type: AWS::SQS::Queue
/// "#);
/// assert_eq!(template.len(), 1);
/// ```
#[macro_export]
macro_rules! template {
    { $expr:expr } => {
        $crate::template::Template::from_yaml_str($expr).expect("template must parse")
    };
}
