//! Per-run context
//!
//! Everything a template would otherwise pick up from the ambient account/region is passed in
//! explicitly, so independent runs never share state.
use crate::value::Value;
use indexmap::IndexMap;

#[derive(Debug, Clone, Default, derive_new::new)]
pub struct RunContext {
    /// Token that must appear in externally visible names, e.g. `qa17`
    #[new(default)]
    pub environment_token: Option<String>,
    /// Selects the deletion-policy allow-list, e.g. `ephemeral` or `production`
    pub environment_class: String,
    /// Deployed environment to compare against; enables the live path
    #[new(default)]
    pub environment_id: Option<String>,
    #[new(default)]
    pub account_id: Option<String>,
    #[new(default)]
    pub region: Option<String>,
    #[new(default)]
    pub partition: Option<String>,
    #[new(default)]
    pub stack_name: Option<String>,
    /// Parameter values overriding template defaults
    #[new(default)]
    pub parameters: IndexMap<String, Value>,
}

impl RunContext {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.environment_token = Some(token.into());
        self
    }

    pub fn with_environment(mut self, environment_id: impl Into<String>) -> Self {
        self.environment_id = Some(environment_id.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Value of a pseudo parameter, `None` when it is only known at deploy time
    pub(crate) fn pseudo(&self, name: &str) -> Option<PseudoValue> {
        let known = |value: &Option<String>| match value {
            Some(value) => PseudoValue::Known(Value::from(value.as_str())),
            None => PseudoValue::Deferred,
        };

        Some(match name {
            "AWS::Region" => known(&self.region),
            "AWS::AccountId" => known(&self.account_id),
            "AWS::StackName" => known(&self.stack_name),
            "AWS::Partition" => match &self.partition {
                Some(partition) => PseudoValue::Known(Value::from(partition.as_str())),
                None => PseudoValue::Known(Value::from("aws")),
            },
            "AWS::URLSuffix" => PseudoValue::Known(Value::from("amazonaws.com")),
            "AWS::NoValue" => PseudoValue::NoValue,
            "AWS::StackId" | "AWS::NotificationARNs" => PseudoValue::Deferred,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PseudoValue {
    Known(Value),
    /// provider assigned
    Deferred,
    /// removes the enclosing property
    NoValue,
}
