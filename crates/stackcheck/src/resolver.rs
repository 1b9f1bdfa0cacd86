//! Intrinsic resolver
//!
//! Symbolically evaluates every property of every resource without live values. Each expression
//! becomes one of:
//! - [Resolved::Literal]: fully known before deployment
//! - [Resolved::Symbolic]: only known after deployment, with the literal skeleton kept
//! - [Resolved::Unresolvable]: cannot be evaluated even symbolically (e.g. a lookup keyed by a
//!   deploy-time value)
//!
//! Structural problems (dangling references, cycles, unknown mappings, ...) are fatal and
//! returned as [StructuralError].
//!
//! # Evaluation
//!
//! Resources are resolved one at a time on an explicit work stack. When resolving a node needs
//! the value of another node (a `Ref` returning a property, a statically known attribute) or of
//! a condition, the attempt is abandoned, the dependency is pushed and the node is retried once
//! the dependency is done. A dependency already on the stack is a cycle. Finished nodes and
//! conditions are memoized, so each is resolved exactly once per run however many dependents it
//! has.
use crate::config::RuleConfig;
use crate::context::{PseudoValue, RunContext};
use crate::error::StructuralError;
use crate::expression::{Expression, ExpressionKind, Property, Segment};
use crate::template::{NodeIndex, Template};
use crate::util::{FieldPath, PathSegment};
use crate::value::Value;
use base64::Engine;
use indexmap::IndexMap;
use serde::ser::SerializeStruct;

/// Default bound on the length of a dependency chain
pub const DEFAULT_DEPTH_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Literal(Value),
    List(Vec<Resolved>),
    Map(IndexMap<String, Resolved>),
    Symbolic(Symbolic),
    Unresolvable(Unresolvable),
}

/// Value only known after deployment
#[derive(Debug, Clone, PartialEq)]
pub struct Symbolic {
    pub kind: ExpressionKind,
    /// Resources whose deploy-time values this depends on
    pub references: Vec<String>,
    /// Known literal text around the unknown parts
    pub skeleton: Vec<SkeletonPart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkeletonPart {
    Text(String),
    Hole,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unresolvable {
    pub reason: String,
    pub references: Vec<String>,
}

impl Symbolic {
    fn opaque(kind: ExpressionKind, references: Vec<String>) -> Self {
        Self {
            kind,
            references,
            skeleton: vec![SkeletonPart::Hole],
        }
    }

    /// Literal fragments of the skeleton
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.skeleton.iter().filter_map(|part| match part {
            SkeletonPart::Text(text) => Some(text.as_str()),
            SkeletonPart::Hole => None,
        })
    }
}

impl std::fmt::Display for Symbolic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for part in &self.skeleton {
            match part {
                SkeletonPart::Text(text) => f.write_str(text)?,
                SkeletonPart::Hole => f.write_str("${?}")?,
            }
        }
        Ok(())
    }
}

impl Unresolvable {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            references: vec![],
        }
    }
}

impl Resolved {
    /// List that collapses to a literal array when every element is literal
    pub fn list(items: Vec<Resolved>) -> Self {
        if items.iter().all(|item| matches!(item, Resolved::Literal(_))) {
            Resolved::Literal(Value::Array(
                items.into_iter().filter_map(Resolved::into_literal).collect(),
            ))
        } else {
            Resolved::List(items)
        }
    }

    /// Map that collapses to a literal object when every entry is literal
    pub fn map(entries: IndexMap<String, Resolved>) -> Self {
        if entries.values().all(|entry| matches!(entry, Resolved::Literal(_))) {
            Resolved::Literal(Value::Object(
                entries
                    .into_iter()
                    .filter_map(|(key, entry)| entry.into_literal().map(|value| (key, value)))
                    .collect(),
            ))
        } else {
            Resolved::Map(entries)
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Resolved::Literal(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_literal(self) -> Option<Value> {
        match self {
            Resolved::Literal(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_symbolic(&self) -> Option<&Symbolic> {
        match self {
            Resolved::Symbolic(symbolic) => Some(symbolic),
            _ => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Resolved::Literal(_))
    }

    /// Resources this value depends on at deploy time, in first-seen order
    pub fn references(&self) -> Vec<String> {
        let mut references = vec![];
        self.collect_references(&mut references);
        references
    }

    fn collect_references(&self, into: &mut Vec<String>) {
        let extend = |into: &mut Vec<String>, references: &[String]| {
            for reference in references {
                if !into.contains(reference) {
                    into.push(reference.clone());
                }
            }
        };

        match self {
            Resolved::Literal(_) => {}
            Resolved::List(items) => items.iter().for_each(|item| item.collect_references(into)),
            Resolved::Map(entries) => entries
                .values()
                .for_each(|entry| entry.collect_references(into)),
            Resolved::Symbolic(symbolic) => extend(into, &symbolic.references),
            Resolved::Unresolvable(unresolvable) => extend(into, &unresolvable.references),
        }
    }

    /// Value at `path`
    ///
    /// Descending into a symbolic or unresolvable value yields that value itself, since
    /// everything below it is equally unknown.
    pub fn get(&self, path: &FieldPath) -> Option<Resolved> {
        self.get_path(path.segments())
    }

    pub fn get_path(&self, path: &[PathSegment]) -> Option<Resolved> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self.clone());
        };

        match (self, first) {
            (Resolved::Literal(value), _) => value.get_path(path).cloned().map(Resolved::Literal),
            (Resolved::Map(entries), segment) => {
                entries.get(segment.as_key().as_ref())?.get_path(rest)
            }
            (Resolved::List(items), PathSegment::Index(index)) => items.get(*index)?.get_path(rest),
            (Resolved::List(_), PathSegment::Key(_)) => None,
            (Resolved::Symbolic(_) | Resolved::Unresolvable(_), _) => Some(self.clone()),
        }
    }
}

impl serde::Serialize for Resolved {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Resolved::Literal(value) => value.serialize(serializer),
            Resolved::List(items) => serializer.collect_seq(items),
            Resolved::Map(entries) => serializer.collect_map(entries),
            Resolved::Symbolic(symbolic) => symbolic.serialize(serializer),
            Resolved::Unresolvable(unresolvable) => {
                let mut ser = serializer.serialize_struct("Unresolvable", 2)?;
                ser.serialize_field("unresolvable", &unresolvable.reason)?;
                ser.serialize_field("references", &unresolvable.references)?;
                ser.end()
            }
        }
    }
}

impl serde::Serialize for Symbolic {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut ser = serializer.serialize_struct("Symbolic", 3)?;
        ser.serialize_field("symbolic", &self.kind)?;
        ser.serialize_field("references", &self.references)?;
        ser.serialize_field("skeleton", &self.to_string())?;
        ser.end()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ResolvedNode {
    pub id: String,
    pub properties: IndexMap<String, Resolved>,
    /// Value of the resource's condition; `None` when it depends on deploy-time values
    pub active: Option<bool>,
}

impl ResolvedNode {
    pub fn property(&self, path: &FieldPath) -> Option<Resolved> {
        let (first, rest) = path.segments().split_first()?;
        self.properties
            .get(first.as_key().as_ref())?
            .get_path(rest)
    }

    /// Whether rules apply, i.e. the resource is not known to be switched off
    pub fn is_active(&self) -> bool {
        self.active != Some(false)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ResolvedOutput {
    pub name: String,
    pub value: Option<Resolved>,
    pub export: Option<Resolved>,
    pub active: Option<bool>,
}

/// Counters used to check that memoization holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    /// Nodes resolved to completion
    pub node_resolutions: usize,
    pub condition_evaluations: usize,
    /// Attempts including the ones abandoned for a missing dependency
    pub attempts: usize,
}

/// Every resource, condition and output of a template, resolved
///
/// Built once per run and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTemplate {
    nodes: Vec<ResolvedNode>,
    pub conditions: IndexMap<String, Resolved>,
    pub outputs: IndexMap<String, ResolvedOutput>,
    stats: ResolutionStats,
}

impl ResolvedTemplate {
    pub fn resolve(
        template: &Template,
        context: &RunContext,
        config: &RuleConfig,
    ) -> Result<Self, StructuralError> {
        Resolver::new(template, context, config).resolve_all()
    }

    pub fn nodes(&self) -> &[ResolvedNode] {
        &self.nodes
    }

    /// Resolved node at the same arena position as the template node
    pub fn node(&self, index: NodeIndex) -> &ResolvedNode {
        &self.nodes[index]
    }

    pub fn get(&self, id: &str) -> Option<&ResolvedNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn property(&self, id: &str, path: &FieldPath) -> Option<Resolved> {
        self.get(id)?.property(path)
    }

    pub fn stats(&self) -> ResolutionStats {
        self.stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dependency {
    Node(NodeIndex),
    Condition(usize),
}

/// Why an attempt stopped
#[derive(Debug)]
enum Interrupt {
    /// Needs this dependency first
    Pending(Dependency),
    Fatal(StructuralError),
}

impl From<StructuralError> for Interrupt {
    fn from(value: StructuralError) -> Self {
        Interrupt::Fatal(value)
    }
}

type Attempt<T> = Result<T, Interrupt>;

pub struct Resolver<'a> {
    template: &'a Template,
    context: &'a RunContext,
    config: &'a RuleConfig,
    depth_limit: usize,
    nodes: Vec<Option<ResolvedNode>>,
    conditions: Vec<Option<Resolved>>,
    stats: ResolutionStats,
}

impl<'a> Resolver<'a> {
    pub fn new(template: &'a Template, context: &'a RunContext, config: &'a RuleConfig) -> Self {
        Self {
            template,
            context,
            config,
            depth_limit: DEFAULT_DEPTH_LIMIT,
            nodes: vec![None; template.len()],
            conditions: vec![None; template.conditions.len()],
            stats: Default::default(),
        }
    }

    pub fn with_depth_limit(mut self, depth_limit: usize) -> Self {
        self.depth_limit = depth_limit;
        self
    }

    /// Resolve a single property of a resource
    ///
    /// Returns `Ok(None)` when the resource has no value at `path`.
    pub fn resolve_property(
        &mut self,
        id: &str,
        path: &FieldPath,
    ) -> Result<Option<Resolved>, StructuralError> {
        let Some(index) = self.template.index_of(id) else {
            return Err(StructuralError::DanglingReference {
                from: path.to_string(),
                target: id.to_string(),
            });
        };

        self.drive(Dependency::Node(index))?;
        Ok(self.nodes[index]
            .as_ref()
            .and_then(|node| node.property(path)))
    }

    #[tracing::instrument(skip_all, fields(resources = self.template.len()))]
    pub fn resolve_all(mut self) -> Result<ResolvedTemplate, StructuralError> {
        self.check_parameters()?;
        for index in 0..self.template.len() {
            self.drive(Dependency::Node(index))?;
        }
        for index in 0..self.template.conditions.len() {
            self.drive(Dependency::Condition(index))?;
        }

        let template = self.template;
        let mut outputs = IndexMap::with_capacity(template.outputs.len());
        for output in template.outputs.values() {
            let resolved = self.settle(|resolver| resolver.attempt_output(output))?;
            outputs.insert(output.name.clone(), resolved);
        }

        let nodes = self.nodes.into_iter().flatten().collect::<Vec<_>>();
        let conditions = template
            .conditions
            .keys()
            .cloned()
            .zip(self.conditions.into_iter().flatten())
            .collect();

        tracing::debug!(
            node_resolutions = self.stats.node_resolutions,
            attempts = self.stats.attempts,
            "resolution finished"
        );

        Ok(ResolvedTemplate {
            nodes,
            conditions,
            outputs,
            stats: self.stats,
        })
    }

    /// Run an attempt, resolving whatever it is waiting for, until it completes
    fn settle<T>(&mut self, mut attempt: impl FnMut(&Self) -> Attempt<T>) -> Result<T, StructuralError> {
        loop {
            match attempt(self) {
                Ok(value) => return Ok(value),
                Err(Interrupt::Fatal(err)) => return Err(err),
                Err(Interrupt::Pending(dependency)) => self.drive(dependency)?,
            }
        }
    }

    /// Effective parameter values (override, else default) must be in `AllowedValues`
    fn check_parameters(&self) -> Result<(), StructuralError> {
        for parameter in self.template.parameters.values() {
            if parameter.allowed_values.is_empty() {
                continue;
            }
            let Some(value) = self
                .context
                .parameters
                .get(&parameter.name)
                .or(parameter.default.as_ref())
            else {
                continue;
            };

            if !parameter
                .allowed_values
                .iter()
                .any(|allowed| allowed.loosely_equals(value))
            {
                return Err(StructuralError::DisallowedParameterValue {
                    parameter: parameter.name.clone(),
                    value: value.to_string(),
                    allowed: parameter.allowed_values.iter().map(Value::to_string).collect(),
                });
            }
        }
        Ok(())
    }

    /// Resolve `start` and everything it needs, iteratively
    fn drive(&mut self, start: Dependency) -> Result<(), StructuralError> {
        let mut stack = vec![start];

        while let Some(&current) = stack.last() {
            if self.is_done(current) {
                stack.pop();
                continue;
            }

            self.stats.attempts += 1;
            let outcome = match current {
                Dependency::Node(index) => self.attempt_node(index).map(|node| {
                    self.nodes[index] = Some(node);
                    self.stats.node_resolutions += 1;
                }),
                Dependency::Condition(index) => self.attempt_condition(index).map(|condition| {
                    self.conditions[index] = Some(condition);
                    self.stats.condition_evaluations += 1;
                }),
            };

            match outcome {
                Ok(()) => {
                    stack.pop();
                }
                Err(Interrupt::Fatal(err)) => return Err(err),
                Err(Interrupt::Pending(dependency)) => {
                    if let Some(position) = stack.iter().position(|entry| *entry == dependency) {
                        return Err(self.cycle_error(&stack[position..]));
                    }
                    if stack.len() >= self.depth_limit {
                        return Err(StructuralError::DepthExceeded {
                            from: self.name_of(current).to_string(),
                            limit: self.depth_limit,
                        });
                    }
                    tracing::trace!(
                        from = self.name_of(current),
                        to = self.name_of(dependency),
                        "waiting for dependency"
                    );
                    stack.push(dependency);
                }
            }
        }

        Ok(())
    }

    fn is_done(&self, dependency: Dependency) -> bool {
        match dependency {
            Dependency::Node(index) => self.nodes[index].is_some(),
            Dependency::Condition(index) => self.conditions[index].is_some(),
        }
    }

    fn name_of(&self, dependency: Dependency) -> &str {
        match dependency {
            Dependency::Node(index) => &self.template.resource(index).id,
            Dependency::Condition(index) => self
                .template
                .conditions
                .get_index(index)
                .map(|(name, _)| name.as_str())
                .unwrap_or_default(),
        }
    }

    fn cycle_error(&self, cycle: &[Dependency]) -> StructuralError {
        let names = cycle
            .iter()
            .map(|entry| self.name_of(*entry).to_string())
            .collect();

        if cycle
            .iter()
            .all(|entry| matches!(entry, Dependency::Condition(_)))
        {
            StructuralError::ConditionCycle { cycle: names }
        } else {
            StructuralError::DependencyCycle { cycle: names }
        }
    }

    fn attempt_node(&self, index: NodeIndex) -> Attempt<ResolvedNode> {
        let node = self.template.resource(index);

        let active = match &node.condition {
            Some(condition) => self.truth_of_condition(condition, &node.id)?,
            None => Some(true),
        };

        let mut properties = IndexMap::with_capacity(node.properties.len());
        for (key, property) in &node.properties {
            if let Some(resolved) = self.resolve(property, &node.id)? {
                properties.insert(key.clone(), resolved);
            }
        }

        Ok(ResolvedNode {
            id: node.id.clone(),
            properties,
            active,
        })
    }

    fn attempt_condition(&self, index: usize) -> Attempt<Resolved> {
        let Some((name, condition)) = self.template.conditions.get_index(index) else {
            return Ok(Resolved::Unresolvable(Unresolvable::new("unknown condition")));
        };
        self.value(condition, name)
    }

    fn attempt_output(&self, output: &crate::template::Output) -> Attempt<ResolvedOutput> {
        let from = format!("Outputs.{}", output.name);
        let active = match &output.condition {
            Some(condition) => self.truth_of_condition(condition, &from)?,
            None => Some(true),
        };

        Ok(ResolvedOutput {
            name: output.name.clone(),
            value: self.resolve(&output.value, &from)?,
            export: output
                .export
                .as_ref()
                .map(|export| self.value(export, &from))
                .transpose()?,
            active,
        })
    }

    /// `Ok(None)` means `AWS::NoValue`: the enclosing entry disappears
    fn resolve(&self, property: &Property, from: &str) -> Attempt<Option<Resolved>> {
        match property {
            Property::Literal(value) => Ok(Some(Resolved::Literal(value.clone()))),
            Property::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(item) = self.resolve(item, from)? {
                        resolved.push(item);
                    }
                }
                Ok(Some(Resolved::list(resolved)))
            }
            Property::Map(entries) => {
                let mut resolved = IndexMap::with_capacity(entries.len());
                for (key, entry) in entries {
                    if let Some(entry) = self.resolve(entry, from)? {
                        resolved.insert(key.clone(), entry);
                    }
                }
                Ok(Some(Resolved::map(resolved)))
            }
            Property::Expression(expression) => self.resolve_expression(expression, from),
        }
    }

    /// Resolve where a value is mandatory
    fn value(&self, property: &Property, from: &str) -> Attempt<Resolved> {
        Ok(self.resolve(property, from)?.unwrap_or_else(|| {
            Resolved::Unresolvable(Unresolvable::new("`AWS::NoValue` used as a value"))
        }))
    }

    fn resolve_expression(&self, expression: &Expression, from: &str) -> Attempt<Option<Resolved>> {
        let resolved = match expression {
            Expression::Reference(target) => return self.resolve_reference(target, from),
            Expression::Attribute { target, path } => self.resolve_attribute(target, path, from)?,
            Expression::Interpolation { segments, .. } => {
                let mut splice = Splice::default();
                for segment in segments {
                    match segment {
                        Segment::Literal(text) => splice.push_text(text),
                        Segment::Expression(embedded) => {
                            let embedded = self.value(embedded, from)?;
                            if let Err(unresolvable) = splice.push(&embedded) {
                                return Ok(Some(Resolved::Unresolvable(unresolvable)));
                            }
                        }
                    }
                }
                splice.finish(ExpressionKind::Interpolation)
            }
            Expression::Join { delimiter, items } => self.resolve_join(delimiter, items, from)?,
            Expression::Lookup { map, keys } => self.resolve_lookup(map, keys, from)?,
            Expression::Select { index, list } => self.resolve_select(index, list, from)?,
            Expression::Split { delimiter, source } => match self.value(source, from)? {
                Resolved::Literal(Value::String(source)) => Resolved::Literal(Value::Array(
                    source.split(delimiter.as_str()).map(Value::from).collect(),
                )),
                unresolvable @ Resolved::Unresolvable(_) => unresolvable,
                Resolved::Literal(other) => Resolved::Unresolvable(Unresolvable::new(format!(
                    "cannot split `{other}`, it is not a string"
                ))),
                other => Resolved::Symbolic(Symbolic::opaque(ExpressionKind::Split, other.references())),
            },
            Expression::Condition(name) => self.condition(name, from)?,
            Expression::If {
                condition,
                then,
                otherwise,
            } => {
                return match self.truth_of_condition(condition, from)? {
                    Some(true) => self.resolve(then, from),
                    Some(false) => self.resolve(otherwise, from),
                    None => {
                        // both branches are still checked for dangling references and cycles
                        let then = self.resolve(then, from)?;
                        let otherwise = self.resolve(otherwise, from)?;
                        let mut references = vec![];
                        for branch in [then, otherwise].iter().flatten() {
                            branch.collect_references(&mut references);
                        }
                        Ok(Some(Resolved::Symbolic(Symbolic::opaque(
                            ExpressionKind::If,
                            references,
                        ))))
                    }
                };
            }
            Expression::Equals(left, right) => {
                let left = self.value(left, from)?;
                let right = self.value(right, from)?;
                match (&left, &right) {
                    (Resolved::Literal(left), Resolved::Literal(right)) => {
                        Resolved::Literal(Value::Boolean(left.loosely_equals(right)))
                    }
                    (Resolved::Unresolvable(unresolvable), _)
                    | (_, Resolved::Unresolvable(unresolvable)) => {
                        Resolved::Unresolvable(unresolvable.clone())
                    }
                    _ => {
                        let mut references = left.references();
                        right.collect_references(&mut references);
                        Resolved::Symbolic(Symbolic::opaque(ExpressionKind::Condition, references))
                    }
                }
            }
            Expression::And(operands) => self.resolve_logic(operands, false, from)?,
            Expression::Or(operands) => self.resolve_logic(operands, true, from)?,
            Expression::Not(operand) => {
                let operand = self.value(operand, from)?;
                match truth(&operand) {
                    Ok(Some(value)) => Resolved::Literal(Value::Boolean(!value)),
                    Ok(None) => Resolved::Symbolic(Symbolic::opaque(
                        ExpressionKind::Condition,
                        operand.references(),
                    )),
                    Err(unresolvable) => Resolved::Unresolvable(unresolvable),
                }
            }
            Expression::Import(name) => {
                let name = self.value(name, from)?;
                Resolved::Symbolic(Symbolic::opaque(ExpressionKind::Import, name.references()))
            }
            Expression::AvailabilityZones(region) => {
                let region = self.value(region, from)?;
                Resolved::Symbolic(Symbolic::opaque(
                    ExpressionKind::AvailabilityZones,
                    region.references(),
                ))
            }
            Expression::Base64(source) => match self.value(source, from)? {
                Resolved::Literal(Value::String(text)) => Resolved::Literal(Value::String(
                    base64::engine::general_purpose::STANDARD.encode(text),
                )),
                unresolvable @ Resolved::Unresolvable(_) => unresolvable,
                other => Resolved::Symbolic(Symbolic::opaque(ExpressionKind::Base64, other.references())),
            },
        };

        Ok(Some(resolved))
    }

    fn resolve_reference(&self, target: &str, from: &str) -> Attempt<Option<Resolved>> {
        if let Some(index) = self.template.index_of(target) {
            let node = self.template.resource(index);
            let ref_property = self
                .config
                .resource_type(&node.resource_type)
                .and_then(|spec| spec.ref_property.as_deref())
                .filter(|property| node.properties.contains_key(*property));

            let Some(ref_property) = ref_property else {
                return Ok(Some(Resolved::Symbolic(Symbolic::opaque(
                    ExpressionKind::Reference,
                    vec![target.to_string()],
                ))));
            };

            let resolved = self.resolved_node(index)?;
            return Ok(Some(match resolved.properties.get(ref_property) {
                Some(value) => value.clone(),
                None => Resolved::Symbolic(Symbolic::opaque(
                    ExpressionKind::Reference,
                    vec![target.to_string()],
                )),
            }));
        }

        if let Some(parameter) = self.template.parameters.get(target) {
            let value = self
                .context
                .parameters
                .get(target)
                .or(parameter.default.as_ref());

            return Ok(Some(match value {
                Some(value) if is_list_parameter(&parameter.parameter_type) => {
                    match value {
                        Value::String(joined) => Resolved::Literal(Value::Array(
                            joined.split(',').map(|item| Value::from(item.trim())).collect(),
                        )),
                        other => Resolved::Literal(other.clone()),
                    }
                }
                Some(value) => Resolved::Literal(value.clone()),
                None => Resolved::Symbolic(Symbolic::opaque(ExpressionKind::Parameter, vec![])),
            }));
        }

        match self.context.pseudo(target) {
            Some(PseudoValue::Known(value)) => Ok(Some(Resolved::Literal(value))),
            Some(PseudoValue::Deferred) => Ok(Some(Resolved::Symbolic(Symbolic::opaque(
                ExpressionKind::Pseudo,
                vec![],
            )))),
            Some(PseudoValue::NoValue) => Ok(None),
            None => Err(StructuralError::DanglingReference {
                from: from.to_string(),
                target: target.to_string(),
            }
            .into()),
        }
    }

    fn resolve_attribute(&self, target: &str, path: &[String], from: &str) -> Attempt<Resolved> {
        let Some(index) = self.template.index_of(target) else {
            return Err(StructuralError::DanglingReference {
                from: from.to_string(),
                target: target.to_string(),
            }
            .into());
        };

        let node = self.template.resource(index);
        let symbolic = || {
            Resolved::Symbolic(Symbolic::opaque(
                ExpressionKind::Attribute,
                vec![target.to_string()],
            ))
        };

        let attribute = path.join(".");
        let pass_through = self
            .config
            .resource_type(&node.resource_type)
            .and_then(|spec| spec.attributes.get(&attribute))
            .filter(|property| match property.segments().first() {
                Some(first) => node.properties.contains_key(first.as_key().as_ref()),
                None => false,
            });

        let Some(property) = pass_through else {
            return Ok(symbolic());
        };

        let resolved = self.resolved_node(index)?;
        Ok(resolved.property(property).unwrap_or_else(symbolic))
    }

    fn resolve_join(&self, delimiter: &str, items: &Property, from: &str) -> Attempt<Resolved> {
        let items = match self.value(items, from)? {
            Resolved::Literal(Value::Array(values)) => {
                values.into_iter().map(Resolved::Literal).collect::<Vec<_>>()
            }
            Resolved::List(items) => items,
            unresolvable @ Resolved::Unresolvable(_) => return Ok(unresolvable),
            Resolved::Literal(other) => {
                return Ok(Resolved::Unresolvable(Unresolvable::new(format!(
                    "cannot join `{other}`, it is not a list"
                ))))
            }
            other => {
                return Ok(Resolved::Symbolic(Symbolic::opaque(
                    ExpressionKind::Join,
                    other.references(),
                )))
            }
        };

        let mut splice = Splice::default();
        for (position, item) in items.iter().enumerate() {
            if position > 0 {
                splice.push_text(delimiter);
            }
            if let Err(unresolvable) = splice.push(item) {
                return Ok(Resolved::Unresolvable(unresolvable));
            }
        }

        Ok(splice.finish(ExpressionKind::Join))
    }

    fn resolve_lookup(&self, map: &Property, keys: &[Property], from: &str) -> Attempt<Resolved> {
        let mut resolved_keys = Vec::with_capacity(keys.len() + 1);
        for key in std::iter::once(map).chain(keys) {
            let key = self.value(key, from)?;
            match &key {
                Resolved::Literal(value) => match value.to_text() {
                    Some(text) => resolved_keys.push(text),
                    None => {
                        return Ok(Resolved::Unresolvable(Unresolvable::new(format!(
                            "mapping key `{value}` is not a scalar"
                        ))))
                    }
                },
                Resolved::Unresolvable(unresolvable) => {
                    return Ok(Resolved::Unresolvable(unresolvable.clone()))
                }
                other => {
                    return Ok(Resolved::Unresolvable(Unresolvable {
                        reason: "mapping key is only known after deployment".to_string(),
                        references: other.references(),
                    }))
                }
            }
        }

        let (map_name, keys) = resolved_keys.split_at(1);
        let map_name = &map_name[0];
        let Some(mapping) = self.template.mappings.get(map_name) else {
            return Err(StructuralError::UnknownMapping {
                from: from.to_string(),
                map: map_name.clone(),
            }
            .into());
        };

        let path = keys
            .iter()
            .map(|key| PathSegment::Key(key.clone()))
            .collect::<Vec<_>>();
        match mapping.get_path(&path) {
            Some(value) => Ok(Resolved::Literal(value.clone())),
            None => Err(StructuralError::MissingMappingKey {
                from: from.to_string(),
                map: map_name.clone(),
                keys: keys.to_vec(),
            }
            .into()),
        }
    }

    fn resolve_select(&self, index: &Property, list: &Property, from: &str) -> Attempt<Resolved> {
        let index = match self.value(index, from)? {
            Resolved::Literal(value) => match value.as_i64().and_then(|i| usize::try_from(i).ok()) {
                Some(index) => index,
                None => {
                    return Ok(Resolved::Unresolvable(Unresolvable::new(format!(
                        "`{value}` is not a list index"
                    ))))
                }
            },
            Resolved::Unresolvable(unresolvable) => return Ok(Resolved::Unresolvable(unresolvable)),
            other => {
                return Ok(Resolved::Unresolvable(Unresolvable {
                    reason: "list index is only known after deployment".to_string(),
                    references: other.references(),
                }))
            }
        };

        let out_of_range = |len| {
            Interrupt::Fatal(StructuralError::IndexOutOfRange {
                from: from.to_string(),
                index,
                len,
            })
        };

        match self.value(list, from)? {
            Resolved::Literal(Value::Array(values)) => values
                .get(index)
                .cloned()
                .map(Resolved::Literal)
                .ok_or_else(|| out_of_range(values.len())),
            Resolved::List(items) => items
                .get(index)
                .cloned()
                .ok_or_else(|| out_of_range(items.len())),
            unresolvable @ Resolved::Unresolvable(_) => Ok(unresolvable),
            Resolved::Literal(other) => Ok(Resolved::Unresolvable(Unresolvable::new(format!(
                "cannot select from `{other}`, it is not a list"
            )))),
            other => Ok(Resolved::Symbolic(Symbolic::opaque(
                ExpressionKind::Select,
                other.references(),
            ))),
        }
    }

    /// `Fn::And` (`short_circuit == false`) or `Fn::Or` (`short_circuit == true`)
    fn resolve_logic(&self, operands: &[Property], short_circuit: bool, from: &str) -> Attempt<Resolved> {
        let mut unknown = vec![];
        for operand in operands {
            let operand = self.value(operand, from)?;
            match truth(&operand) {
                Ok(Some(value)) if value == short_circuit => {
                    return Ok(Resolved::Literal(Value::Boolean(short_circuit)))
                }
                Ok(Some(_)) => {}
                Ok(None) => unknown.push(operand),
                Err(unresolvable) => return Ok(Resolved::Unresolvable(unresolvable)),
            }
        }

        if unknown.is_empty() {
            return Ok(Resolved::Literal(Value::Boolean(!short_circuit)));
        }

        let mut references = vec![];
        for operand in &unknown {
            operand.collect_references(&mut references);
        }
        Ok(Resolved::Symbolic(Symbolic::opaque(
            ExpressionKind::Condition,
            references,
        )))
    }

    fn condition(&self, name: &str, from: &str) -> Attempt<Resolved> {
        let Some(index) = self.template.conditions.get_index_of(name) else {
            return Err(StructuralError::UnknownCondition {
                from: from.to_string(),
                condition: name.to_string(),
            }
            .into());
        };

        match &self.conditions[index] {
            Some(resolved) => Ok(resolved.clone()),
            None => Err(Interrupt::Pending(Dependency::Condition(index))),
        }
    }

    /// Three-valued: `None` when the condition depends on deploy-time values
    fn truth_of_condition(&self, name: &str, from: &str) -> Attempt<Option<bool>> {
        Ok(truth(&self.condition(name, from)?).unwrap_or(None))
    }

    fn resolved_node(&self, index: NodeIndex) -> Attempt<&ResolvedNode> {
        self.nodes[index]
            .as_ref()
            .ok_or(Interrupt::Pending(Dependency::Node(index)))
    }
}

fn is_list_parameter(parameter_type: &str) -> bool {
    parameter_type == "CommaDelimitedList" || parameter_type.starts_with("List<")
}

fn truth(resolved: &Resolved) -> Result<Option<bool>, Unresolvable> {
    match resolved {
        Resolved::Literal(value) => match value.as_bool() {
            Some(value) => Ok(Some(value)),
            None => Err(Unresolvable::new(format!("`{value}` is not a boolean"))),
        },
        Resolved::Unresolvable(unresolvable) => Err(unresolvable.clone()),
        Resolved::Symbolic(_) => Ok(None),
        Resolved::List(_) | Resolved::Map(_) => Err(Unresolvable::new("a collection is not a boolean")),
    }
}

/// String under construction from literal and symbolic pieces
#[derive(Default)]
struct Splice {
    parts: Vec<SkeletonPart>,
    references: Vec<String>,
}

impl Splice {
    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(SkeletonPart::Text(last)) = self.parts.last_mut() {
            last.push_str(text);
        } else {
            self.parts.push(SkeletonPart::Text(text.to_string()));
        }
    }

    fn push(&mut self, resolved: &Resolved) -> Result<(), Unresolvable> {
        match resolved {
            Resolved::Literal(value) => match value.to_text() {
                Some(text) => self.push_text(&text),
                None => {
                    return Err(Unresolvable::new(format!(
                        "cannot splice `{value}` into a string"
                    )))
                }
            },
            Resolved::Symbolic(symbolic) => {
                for part in &symbolic.skeleton {
                    match part {
                        SkeletonPart::Text(text) => self.push_text(text),
                        SkeletonPart::Hole => self.parts.push(SkeletonPart::Hole),
                    }
                }
                for reference in &symbolic.references {
                    if !self.references.contains(reference) {
                        self.references.push(reference.clone());
                    }
                }
            }
            Resolved::Unresolvable(unresolvable) => return Err(unresolvable.clone()),
            Resolved::List(_) | Resolved::Map(_) => {
                return Err(Unresolvable::new("cannot splice a collection into a string"))
            }
        }
        Ok(())
    }

    fn finish(self, kind: ExpressionKind) -> Resolved {
        if self.parts.contains(&SkeletonPart::Hole) {
            return Resolved::Symbolic(Symbolic {
                kind,
                references: self.references,
                skeleton: self.parts,
            });
        }

        let text = self
            .parts
            .into_iter()
            .map(|part| match part {
                SkeletonPart::Text(text) => text,
                SkeletonPart::Hole => String::new(),
            })
            .collect::<String>();
        Resolved::Literal(Value::String(text))
    }
}
