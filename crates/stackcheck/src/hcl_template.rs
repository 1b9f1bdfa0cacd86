//! HCL front-end
//!
//! Lowers an HCL document into the same raw shape the JSON/YAML loaders produce, so that
//! [crate::expression] is the only place that interprets intrinsics.
//!
//! ```hcl
//! description = "data tier"
//!
//! parameter "Env" {
//!   type    = "String"
//!   default = "qa17"
//! }
//!
//! condition "IsProd" {
//!   value = param.Env == "prod"
//! }
//!
//! resource "AWS::S3::Bucket" "Data" {
//!   deletion_policy = "Delete"
//!   depends_on      = ["Key"]
//!
//!   properties {
//!     BucketName = "app-${param.Env}-data"
//!     KeyArn     = attr.Key.Arn
//!     Versioning = condition.IsProd ? "Enabled" : "Suspended"
//!   }
//! }
//!
//! output "DataBucket" {
//!   value = ref.Data
//! }
//! ```
//!
//! Traversal roots: `ref.X` (`Ref`), `param.X` (`Ref` to a parameter), `pseudo.Region`
//! (`Ref` to `AWS::Region`), `attr.X.Attr` (`Fn::GetAtt`) and `condition.X`.
//! Functions: `lookup`, `element`, `join`, `split`, `base64encode`, `import` and `azs`.
use crate::error::ParseError;
use crate::template::RawTemplate;
use hcl::template::Element;
use hcl::{Expression, ObjectKey, Operation, TraversalOperator};
use hcl_edit::structure::{Body, Structure};
use serde_json::{json, Map, Value as Raw};

pub(crate) fn lower(text: &str) -> Result<RawTemplate<Raw>, ParseError> {
    let body = hcl_edit::parser::parse_body(text).map_err(|err| ParseError::Syntax {
        message: err.to_string(),
    })?;

    let mut raw = RawTemplate::<Raw>::default();

    for structure in body.into_iter() {
        match structure {
            Structure::Attribute(attribute) => {
                let key = attribute.key.value().as_str().to_string();
                let value = lower_expression(&attribute.value.clone().into(), &key)?;
                match key.as_str() {
                    "description" => raw.description = Some(value),
                    "format_version" => raw.format_version = Some(value),
                    _ => {
                        return Err(ParseError::Unsupported {
                            path: key,
                            reason: "unknown root attribute".to_string(),
                        })
                    }
                }
            }
            Structure::Block(block) => {
                let kind = block.ident.value().as_str().to_string();
                let labels: Vec<String> = block
                    .labels
                    .iter()
                    .map(|label| label.as_str().to_string())
                    .collect();

                match (kind.as_str(), labels.as_slice()) {
                    ("parameter", [name]) => {
                        let path = format!("Parameters.{name}");
                        let declaration = rename_keys(
                            lower_body(&block.body, &path)?,
                            &[
                                ("type", "Type"),
                                ("default", "Default"),
                                ("allowed_values", "AllowedValues"),
                                ("description", "Description"),
                            ],
                            &path,
                        )?;
                        raw.parameters.0.push((name.clone(), Raw::Object(declaration)));
                    }
                    ("mapping", [name]) => {
                        let path = format!("Mappings.{name}");
                        raw.mappings
                            .0
                            .push((name.clone(), Raw::Object(lower_body(&block.body, &path)?)));
                    }
                    ("condition", [name]) => {
                        let path = format!("Conditions.{name}");
                        let mut declaration = lower_body(&block.body, &path)?;
                        let Some(value) = declaration.remove("value") else {
                            return Err(ParseError::shape(format!("{path}.value"), "a condition"));
                        };
                        raw.conditions.0.push((name.clone(), value));
                    }
                    ("resource", [resource_type, id]) => {
                        let path = format!("Resources.{id}");
                        let mut declaration = rename_keys(
                            lower_body(&block.body, &path)?,
                            &[
                                ("properties", "Properties"),
                                ("depends_on", "DependsOn"),
                                ("deletion_policy", "DeletionPolicy"),
                                ("update_replace_policy", "UpdateReplacePolicy"),
                                ("condition", "Condition"),
                            ],
                            &path,
                        )?;
                        if let Some(depends_on) = declaration.get_mut("DependsOn") {
                            *depends_on = unwrap_refs(std::mem::take(depends_on));
                        }
                        declaration.insert("Type".to_string(), Raw::String(resource_type.clone()));
                        raw.resources.0.push((id.clone(), Raw::Object(declaration)));
                    }
                    ("output", [name]) => {
                        let path = format!("Outputs.{name}");
                        let mut declaration = rename_keys(
                            lower_body(&block.body, &path)?,
                            &[("value", "Value"), ("condition", "Condition")],
                            &path,
                        )?;
                        if let Some(export) = declaration.remove("export") {
                            declaration.insert("Export".to_string(), json!({ "Name": export }));
                        }
                        raw.outputs.0.push((name.clone(), Raw::Object(declaration)));
                    }
                    _ => {
                        return Err(ParseError::Unsupported {
                            path: std::iter::once(kind.clone())
                                .chain(labels.iter().cloned())
                                .collect::<Vec<_>>()
                                .join("."),
                            reason: format!("unknown block `{kind}` or wrong number of labels"),
                        })
                    }
                }
            }
        }
    }

    tracing::trace!(
        resources = raw.resources.0.len(),
        "lowered hcl document"
    );

    Ok(raw)
}

/// Attributes become keys, nested blocks become objects (lists when repeated)
fn lower_body(body: &Body, path: &str) -> Result<Map<String, Raw>, ParseError> {
    let mut object = Map::new();

    for attribute in body.attributes() {
        let key = attribute.key.value().as_str().to_string();
        let value = lower_expression(&attribute.value.clone().into(), &format!("{path}.{key}"))?;
        object.insert(key, value);
    }

    for block in body.blocks() {
        let key = block.ident.value().as_str().to_string();
        let value = Raw::Object(lower_body(&block.body, &format!("{path}.{key}"))?);
        match object.get_mut(&key) {
            None => {
                object.insert(key, value);
            }
            Some(Raw::Array(existing)) => existing.push(value),
            Some(existing) => {
                let first = std::mem::take(existing);
                *existing = Raw::Array(vec![first, value]);
            }
        }
    }

    Ok(object)
}

fn rename_keys(
    object: Map<String, Raw>,
    renames: &[(&str, &str)],
    path: &str,
) -> Result<Map<String, Raw>, ParseError> {
    object
        .into_iter()
        .map(|(key, value)| {
            match renames.iter().find(|(from, _)| *from == key) {
                Some((_, to)) => Ok((to.to_string(), value)),
                // anything else is left for the section parser to ignore or reject
                None if key == "export" => Ok((key, value)),
                None => Err(ParseError::Unsupported {
                    path: format!("{path}.{key}"),
                    reason: "unknown attribute".to_string(),
                }),
            }
        })
        .collect()
}

/// `depends_on = [ref.A, "B"]` is accepted as well as plain strings
fn unwrap_refs(value: Raw) -> Raw {
    match value {
        Raw::Array(items) => Raw::Array(items.into_iter().map(unwrap_refs).collect()),
        Raw::Object(mut object) if object.len() == 1 && object.contains_key("Ref") => {
            object.remove("Ref").unwrap_or(Raw::Null)
        }
        other => other,
    }
}

fn unsupported(path: &str, reason: impl Into<String>) -> ParseError {
    ParseError::Unsupported {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn intrinsic(name: &str, argument: Raw) -> Raw {
    let mut object = Map::with_capacity(1);
    object.insert(name.to_string(), argument);
    Raw::Object(object)
}

fn lower_expression(expression: &Expression, path: &str) -> Result<Raw, ParseError> {
    Ok(match expression {
        Expression::Null => Raw::Null,
        Expression::Bool(b) => Raw::Bool(*b),
        Expression::Number(number) => lower_number(number, path)?,
        Expression::String(s) => Raw::String(s.clone()),
        Expression::Array(items) => Raw::Array(
            items
                .iter()
                .enumerate()
                .map(|(index, item)| lower_expression(item, &format!("{path}.{index}")))
                .collect::<Result<_, _>>()?,
        ),
        Expression::Object(object) => {
            let mut lowered = Map::with_capacity(object.len());
            for (key, value) in object.iter() {
                let key = match key {
                    ObjectKey::Identifier(ident) => ident.to_string(),
                    ObjectKey::Expression(expr) => match lower_expression(expr, path)? {
                        Raw::String(s) => s,
                        _ => return Err(unsupported(path, "object keys must be strings")),
                    },
                    #[allow(unreachable_patterns)]
                    _ => return Err(unsupported(path, "unsupported object key")),
                };
                let value = lower_expression(value, &format!("{path}.{key}"))?;
                lowered.insert(key, value);
            }
            Raw::Object(lowered)
        }
        Expression::Variable(variable) => lower_traversal(variable.as_str(), &[], path)?,
        Expression::Traversal(traversal) => {
            let Expression::Variable(root) = &traversal.expr else {
                return Err(unsupported(path, "traversals must start at a variable"));
            };
            lower_traversal(root.as_str(), &traversal.operators, path)?
        }
        Expression::TemplateExpr(template_expr) => {
            let template = hcl::Template::from_expr(template_expr)
                .map_err(|err| unsupported(path, err.to_string()))?;
            lower_template(template.elements(), path)?
        }
        Expression::FuncCall(func) => {
            let name = func.name.to_string();
            let args = func
                .args
                .iter()
                .map(|arg| lower_expression(arg, path))
                .collect::<Result<Vec<_>, _>>()?;
            lower_function(&name, args, path)?
        }
        Expression::Parenthesis(inner) => lower_expression(inner, path)?,
        Expression::Conditional(conditional) => {
            let condition = lower_expression(&conditional.cond_expr, path)?;
            let Some(Raw::String(condition)) = condition.get("Condition").cloned() else {
                return Err(unsupported(path, "conditionals must test `condition.<Name>`"));
            };
            intrinsic(
                "Fn::If",
                json!([
                    condition,
                    lower_expression(&conditional.true_expr, path)?,
                    lower_expression(&conditional.false_expr, path)?
                ]),
            )
        }
        Expression::Operation(operation) => lower_operation(operation, path)?,
        _ => return Err(unsupported(path, "unsupported expression")),
    })
}

fn lower_number(number: &hcl::Number, path: &str) -> Result<Raw, ParseError> {
    if let Some(int) = number.as_i64() {
        return Ok(int.into());
    }
    if let Some(int) = number.as_u64() {
        return Ok(int.into());
    }
    number
        .as_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Raw::Number)
        .ok_or_else(|| unsupported(path, "number out of range"))
}

fn lower_traversal(
    root: &str,
    operators: &[TraversalOperator],
    path: &str,
) -> Result<Raw, ParseError> {
    let names: Vec<&str> = operators
        .iter()
        .map_while(|operator| match operator {
            TraversalOperator::GetAttr(ident) => Some(ident.as_str()),
            _ => None,
        })
        .collect();
    let rest = &operators[names.len()..];

    let base = match (root, names.as_slice()) {
        ("ref" | "param", [target]) => intrinsic("Ref", json!(target)),
        ("pseudo", [name]) => intrinsic("Ref", json!(format!("AWS::{name}"))),
        ("attr", [target, attribute @ ..]) if !attribute.is_empty() => {
            intrinsic("Fn::GetAtt", json!([target, attribute.join(".")]))
        }
        ("condition", [name]) => intrinsic("Condition", json!(name)),
        _ => {
            return Err(unsupported(
                path,
                format!("cannot resolve `{root}.{}`", names.join(".")),
            ))
        }
    };

    rest.iter().try_fold(base, |list, operator| {
        let index = match operator {
            TraversalOperator::Index(index) => lower_expression(index, path)?,
            TraversalOperator::LegacyIndex(index) => json!(index),
            _ => return Err(unsupported(path, "only index operators may follow a reference")),
        };
        Ok(intrinsic("Fn::Select", json!([index, list])))
    })
}

/// Quoted templates become `Fn::Sub`
fn lower_template(elements: &[Element], path: &str) -> Result<Raw, ParseError> {
    let mut template = String::new();
    let mut variables = Map::new();

    for element in elements {
        match element {
            Element::Literal(text) => template.push_str(&text.replace("${", "${!")),
            Element::Interpolation(interpolation) => {
                let lowered = lower_expression(&interpolation.expr, path)?;
                match inline_name(&lowered) {
                    Some(name) => {
                        template.push_str("${");
                        template.push_str(&name);
                        template.push('}');
                    }
                    None => {
                        let name = format!("V{}", variables.len());
                        template.push_str(&format!("${{{name}}}"));
                        variables.insert(name, lowered);
                    }
                }
            }
            Element::Directive(_) => {
                return Err(unsupported(path, "template directives are not supported"))
            }
        }
    }

    Ok(match (variables.is_empty(), elements) {
        (true, [Element::Literal(text)]) => Raw::String(text.clone()),
        (true, []) => Raw::String(String::new()),
        (true, _) => intrinsic("Fn::Sub", Raw::String(template)),
        (false, _) => intrinsic("Fn::Sub", json!([template, variables])),
    })
}

/// Name usable directly inside `${...}`
fn inline_name(lowered: &Raw) -> Option<String> {
    let Raw::Object(object) = lowered else {
        return None;
    };
    if object.len() != 1 {
        return None;
    }
    match (object.get("Ref"), object.get("Fn::GetAtt")) {
        (Some(Raw::String(target)), _) => Some(target.clone()),
        (_, Some(Raw::Array(parts))) => match parts.as_slice() {
            [Raw::String(target), Raw::String(attribute)] => Some(format!("{target}.{attribute}")),
            _ => None,
        },
        _ => None,
    }
}

fn lower_function(name: &str, args: Vec<Raw>, path: &str) -> Result<Raw, ParseError> {
    let arity = |expected: usize| {
        if args.len() == expected {
            Ok(())
        } else {
            Err(unsupported(
                path,
                format!("`{name}` takes {expected} arguments, got {}", args.len()),
            ))
        }
    };

    Ok(match name {
        "lookup" => {
            arity(3)?;
            intrinsic("Fn::FindInMap", Raw::Array(args))
        }
        "element" => {
            arity(2)?;
            let mut args = args;
            let index = args.pop().unwrap_or(Raw::Null);
            let list = args.pop().unwrap_or(Raw::Null);
            intrinsic("Fn::Select", json!([index, list]))
        }
        "join" => {
            arity(2)?;
            intrinsic("Fn::Join", Raw::Array(args))
        }
        "split" => {
            arity(2)?;
            intrinsic("Fn::Split", Raw::Array(args))
        }
        "base64encode" | "import" | "azs" => {
            arity(1)?;
            let function = match name {
                "base64encode" => "Fn::Base64",
                "import" => "Fn::ImportValue",
                _ => "Fn::GetAZs",
            };
            intrinsic(function, args.into_iter().next().unwrap_or(Raw::Null))
        }
        other => return Err(unsupported(path, format!("unknown function `{other}`"))),
    })
}

fn lower_operation(operation: &Operation, path: &str) -> Result<Raw, ParseError> {
    use hcl::expr::{BinaryOperator, UnaryOperator};

    Ok(match operation {
        Operation::Binary(binary) => {
            let lhs = lower_expression(&binary.lhs_expr, path)?;
            let rhs = lower_expression(&binary.rhs_expr, path)?;
            match binary.operator {
                BinaryOperator::Eq => intrinsic("Fn::Equals", json!([lhs, rhs])),
                BinaryOperator::NotEq => {
                    intrinsic("Fn::Not", json!([intrinsic("Fn::Equals", json!([lhs, rhs]))]))
                }
                BinaryOperator::And => intrinsic("Fn::And", json!([lhs, rhs])),
                BinaryOperator::Or => intrinsic("Fn::Or", json!([lhs, rhs])),
                _ => return Err(unsupported(path, "only ==, !=, && and || are supported")),
            }
        }
        Operation::Unary(unary) => {
            let operand = lower_expression(&unary.expr, path)?;
            match unary.operator {
                UnaryOperator::Not => intrinsic("Fn::Not", json!([operand])),
                UnaryOperator::Neg => {
                    if let Some(int) = operand.as_i64() {
                        json!(-int)
                    } else if let Some(float) = operand.as_f64() {
                        json!(-float)
                    } else {
                        return Err(unsupported(path, "negation of a non-number"));
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expression::{Expression as Intrinsic, Property, Segment};
    use crate::template::Template;
    use pretty_assertions::assert_eq;

    const DOCUMENT: &str = r#"
description = "data tier"

parameter "Env" {
  type    = "String"
  default = "qa17"
}

condition "IsProd" {
  value = param.Env == "prod"
}

resource "AWS::KMS::Key" "Key" {
  deletion_policy = "Delete"
}

resource "AWS::S3::Bucket" "Data" {
  deletion_policy = "Delete"
  depends_on      = [ref.Key]

  properties {
    BucketName = "app-${param.Env}-data"
    KeyArn     = attr.Key.Arn
    Status     = condition.IsProd ? "Enabled" : "Suspended"
    Tags       = [{ Key = "Owner", Value = "platform" }]
  }
}

output "DataBucket" {
  value  = ref.Data
  export = "data-bucket"
}
"#;

    #[test]
    fn lowers_blocks() {
        let template = Template::from_hcl_str(DOCUMENT).unwrap();

        assert_eq!(template.description.as_deref(), Some("data tier"));
        assert!(template.parameters.contains_key("Env"));
        assert!(template.conditions.contains_key("IsProd"));

        let data = template.get("Data").unwrap();
        assert_eq!(data.resource_type, "AWS::S3::Bucket");
        assert_eq!(data.depends_on, vec!["Key"]);
        assert_eq!(data.deletion_policy.as_deref(), Some("Delete"));
        assert_eq!(
            data.properties["KeyArn"],
            Property::expression(Intrinsic::Attribute {
                target: "Key".into(),
                path: vec!["Arn".into()],
            })
        );
        assert!(matches!(
            data.properties["Status"].as_expression(),
            Some(Intrinsic::If { condition, .. }) if condition == "IsProd"
        ));
        assert!(template.outputs["DataBucket"].export.is_some());
    }

    #[test]
    fn templates_become_interpolations() {
        let template = Template::from_hcl_str(DOCUMENT).unwrap();
        let data = template.get("Data").unwrap();

        let Some(Intrinsic::Interpolation { segments, .. }) = data.properties["BucketName"].as_expression()
        else {
            panic!("expected interpolation");
        };
        assert_eq!(
            segments,
            &vec![
                Segment::Literal("app-".into()),
                Segment::Expression(Property::expression(Intrinsic::Reference("Env".into()))),
                Segment::Literal("-data".into()),
            ]
        );
    }

    #[test]
    fn unknown_block_is_rejected() {
        let err = Template::from_hcl_str(r#"module "x" {}"#).unwrap_err();
        assert!(matches!(err, ParseError::Unsupported { .. }));
    }

    #[test]
    fn unknown_traversal_is_rejected() {
        let err = Template::from_hcl_str(
            r#"
resource "AWS::SQS::Queue" "Queue" {
  properties {
    QueueName = var.name
  }
}
"#,
        )
        .unwrap_err();
        assert_eq!(err.path(), Some("Resources.Queue.properties.QueueName"));
    }
}
