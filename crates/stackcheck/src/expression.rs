//! Property values and intrinsic expressions
//!
//! Every property of a resource is a [Property]: a closed tree of literals, lists, maps and
//! [Expression]s. Intrinsic functions use the single-key object form (`{"Ref": "Bucket"}`,
//! `{"Fn::GetAtt": ["Bucket", "Arn"]}`, ...). YAML short tags and the HCL front-end are lowered to
//! this form before parsing, so this module is the only place that knows intrinsic syntax.
use crate::error::ParseError;
use crate::value::Value;
use indexmap::IndexMap;

/// A raw (unresolved) property value
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Literal(Value),
    List(Vec<Property>),
    Map(IndexMap<String, Property>),
    Expression(Box<Expression>),
}

/// Intrinsic expression
///
/// Pure data: resolving it is the job of [crate::resolver].
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// `Ref`: a resource, parameter or pseudo parameter
    Reference(String),
    /// `Fn::GetAtt`
    Attribute { target: String, path: Vec<String> },
    /// `Fn::Sub`
    Interpolation {
        template: String,
        segments: Vec<Segment>,
    },
    /// `Fn::Join`
    Join { delimiter: String, items: Property },
    /// `Fn::FindInMap`
    Lookup { map: Property, keys: Vec<Property> },
    /// `Fn::Select`
    Select { index: Property, list: Property },
    /// `Fn::Split`
    Split { delimiter: String, source: Property },
    /// `Condition`
    Condition(String),
    /// `Fn::If`
    If {
        condition: String,
        then: Property,
        otherwise: Property,
    },
    Equals(Property, Property),
    And(Vec<Property>),
    Or(Vec<Property>),
    Not(Property),
    /// `Fn::ImportValue`, only knowable from another deployed stack
    Import(Property),
    /// `Fn::GetAZs`
    AvailabilityZones(Property),
    Base64(Property),
}

/// Piece of an interpolation template
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Expression(Property),
}

/// Coarse classification of expressions, reported for symbolic values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpressionKind {
    Reference,
    Attribute,
    Parameter,
    Pseudo,
    Interpolation,
    Join,
    Lookup,
    Select,
    Split,
    Condition,
    If,
    Import,
    AvailabilityZones,
    Base64,
}

impl std::fmt::Display for ExpressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExpressionKind::Reference => "reference",
            ExpressionKind::Attribute => "attribute",
            ExpressionKind::Parameter => "parameter",
            ExpressionKind::Pseudo => "pseudo-parameter",
            ExpressionKind::Interpolation => "interpolation",
            ExpressionKind::Join => "join",
            ExpressionKind::Lookup => "lookup",
            ExpressionKind::Select => "select",
            ExpressionKind::Split => "split",
            ExpressionKind::Condition => "condition",
            ExpressionKind::If => "if",
            ExpressionKind::Import => "import",
            ExpressionKind::AvailabilityZones => "availability-zones",
            ExpressionKind::Base64 => "base64",
        })
    }
}

impl Property {
    pub fn literal(value: impl Into<Value>) -> Self {
        Property::Literal(value.into())
    }

    pub fn expression(expression: Expression) -> Self {
        Property::Expression(Box::new(expression))
    }

    pub fn as_expression(&self) -> Option<&Expression> {
        match self {
            Property::Expression(expression) => Some(expression),
            _ => None,
        }
    }

    /// Parse a raw document value found at `path`
    pub fn parse(raw: &serde_json::Value, path: &str) -> Result<Self, ParseError> {
        match raw {
            serde_json::Value::Array(items) => Ok(Property::List(
                items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| Property::parse(item, &format!("{path}.{index}")))
                    .collect::<Result<_, _>>()?,
            )),
            serde_json::Value::Object(object) => {
                if object.len() == 1 {
                    if let Some((name, argument)) = object.iter().next() {
                        if let Some(expression) = parse_intrinsic(name, argument, path)? {
                            return Ok(Property::expression(expression));
                        }
                    }
                }

                let mut map = IndexMap::with_capacity(object.len());
                for (key, value) in object {
                    map.insert(key.clone(), Property::parse(value, &format!("{path}.{key}"))?);
                }

                Ok(Property::Map(map))
            }
            scalar => Ok(Property::Literal(scalar.clone().into())),
        }
    }
}

/// Returns `Ok(None)` when the single-key object is not an intrinsic at all
fn parse_intrinsic(
    name: &str,
    argument: &serde_json::Value,
    path: &str,
) -> Result<Option<Expression>, ParseError> {
    use serde_json::Value as Raw;

    let path = format!("{path}.{name}");
    let expression = match name {
        "Ref" => match argument {
            Raw::String(target) => Expression::Reference(target.clone()),
            _ => return Err(ParseError::malformed(path, name, "expected a logical id")),
        },
        // `Condition` is also an ordinary key, e.g. in policy documents
        "Condition" => match argument {
            Raw::String(condition) => Expression::Condition(condition.clone()),
            _ => return Ok(None),
        },
        "Fn::GetAtt" => parse_get_att(argument, &path)?,
        "Fn::Sub" => parse_sub(argument, &path)?,
        "Fn::Join" => {
            let [delimiter, items] = arguments::<2>(argument, &path, name)?;
            Expression::Join {
                delimiter: string_argument(delimiter, &path, name)?,
                items: Property::parse(items, &path)?,
            }
        }
        "Fn::FindInMap" => {
            let [map, first, second] = arguments::<3>(argument, &path, name)?;
            Expression::Lookup {
                map: Property::parse(map, &path)?,
                keys: vec![
                    Property::parse(first, &path)?,
                    Property::parse(second, &path)?,
                ],
            }
        }
        "Fn::Select" => {
            let [index, list] = arguments::<2>(argument, &path, name)?;
            Expression::Select {
                index: Property::parse(index, &path)?,
                list: Property::parse(list, &path)?,
            }
        }
        "Fn::Split" => {
            let [delimiter, source] = arguments::<2>(argument, &path, name)?;
            Expression::Split {
                delimiter: string_argument(delimiter, &path, name)?,
                source: Property::parse(source, &path)?,
            }
        }
        "Fn::If" => {
            let [condition, then, otherwise] = arguments::<3>(argument, &path, name)?;
            Expression::If {
                condition: string_argument(condition, &path, name)?,
                then: Property::parse(then, &format!("{path}.1"))?,
                otherwise: Property::parse(otherwise, &format!("{path}.2"))?,
            }
        }
        "Fn::Equals" => {
            let [left, right] = arguments::<2>(argument, &path, name)?;
            Expression::Equals(Property::parse(left, &path)?, Property::parse(right, &path)?)
        }
        "Fn::And" | "Fn::Or" => {
            let Raw::Array(items) = argument else {
                return Err(ParseError::malformed(path, name, "expected a list of conditions"));
            };
            let operands = items
                .iter()
                .map(|item| Property::parse(item, &path))
                .collect::<Result<Vec<_>, _>>()?;
            if name == "Fn::And" {
                Expression::And(operands)
            } else {
                Expression::Or(operands)
            }
        }
        "Fn::Not" => {
            let [operand] = arguments::<1>(argument, &path, name)?;
            Expression::Not(Property::parse(operand, &path)?)
        }
        "Fn::ImportValue" => Expression::Import(Property::parse(argument, &path)?),
        "Fn::GetAZs" => Expression::AvailabilityZones(Property::parse(argument, &path)?),
        "Fn::Base64" => Expression::Base64(Property::parse(argument, &path)?),
        other if other.starts_with("Fn::") => {
            return Err(ParseError::UnknownIntrinsic {
                path,
                name: other.to_string(),
            })
        }
        _ => return Ok(None),
    };

    Ok(Some(expression))
}

fn arguments<'a, const N: usize>(
    argument: &'a serde_json::Value,
    path: &str,
    name: &str,
) -> Result<[&'a serde_json::Value; N], ParseError> {
    let serde_json::Value::Array(items) = argument else {
        return Err(ParseError::malformed(path, name, format!("expected a list of {N}")));
    };

    let items: Vec<&serde_json::Value> = items.iter().collect();
    items
        .try_into()
        .map_err(|items: Vec<_>| {
            ParseError::malformed(path, name, format!("expected {N} arguments, got {}", items.len()))
        })
}

fn string_argument(argument: &serde_json::Value, path: &str, name: &str) -> Result<String, ParseError> {
    match argument {
        serde_json::Value::String(s) => Ok(s.clone()),
        _ => Err(ParseError::malformed(path, name, "expected a string")),
    }
}

fn parse_get_att(argument: &serde_json::Value, path: &str) -> Result<Expression, ParseError> {
    const NAME: &str = "Fn::GetAtt";

    let (target, attribute) = match argument {
        serde_json::Value::String(dotted) => match dotted.split_once('.') {
            Some((target, attribute)) => (target.to_string(), attribute.to_string()),
            None => return Err(ParseError::malformed(path, NAME, "expected `LogicalId.Attribute`")),
        },
        serde_json::Value::Array(_) => {
            let [target, attribute] = arguments::<2>(argument, path, NAME)?;
            (
                string_argument(target, path, NAME)?,
                string_argument(attribute, path, NAME)?,
            )
        }
        _ => return Err(ParseError::malformed(path, NAME, "expected a list or a string")),
    };

    if target.is_empty() || attribute.is_empty() {
        return Err(ParseError::malformed(path, NAME, "empty logical id or attribute"));
    }

    Ok(Expression::Attribute {
        target,
        path: attribute.split('.').map(str::to_string).collect(),
    })
}

fn parse_sub(argument: &serde_json::Value, path: &str) -> Result<Expression, ParseError> {
    const NAME: &str = "Fn::Sub";

    let (template, variables) = match argument {
        serde_json::Value::String(template) => (template.clone(), IndexMap::new()),
        serde_json::Value::Array(_) => {
            let [template, variables] = arguments::<2>(argument, path, NAME)?;
            let serde_json::Value::Object(variables) = variables else {
                return Err(ParseError::malformed(path, NAME, "expected a variable map"));
            };
            let variables = variables
                .iter()
                .map(|(key, value)| {
                    Property::parse(value, &format!("{path}.{key}")).map(|p| (key.clone(), p))
                })
                .collect::<Result<IndexMap<_, _>, _>>()?;
            (string_argument(template, path, NAME)?, variables)
        }
        _ => return Err(ParseError::malformed(path, NAME, "expected a string or a list")),
    };

    let segments = split_template(&template, &variables)
        .map_err(|reason| ParseError::malformed(path, NAME, reason))?;

    Ok(Expression::Interpolation { template, segments })
}

/// Split an interpolation template into literal text and embedded expressions
///
/// `${Name}` references a variable, resource, parameter or pseudo parameter,
/// `${Name.Attr}` an attribute and `${!Text}` is the literal `${Text}`.
fn split_template(
    template: &str,
    variables: &IndexMap<String, Property>,
) -> Result<Vec<Segment>, String> {
    let mut segments = vec![];
    let mut literal = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        literal.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(format!("unterminated `${{` in `{template}`"));
        };
        let name = &after[..end];
        rest = &after[end + 1..];

        if let Some(escaped) = name.strip_prefix('!') {
            literal.push_str("${");
            literal.push_str(escaped);
            literal.push('}');
            continue;
        }

        let name = name.trim();
        if name.is_empty() {
            return Err(format!("empty variable in `{template}`"));
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }

        let embedded = match variables.get(name) {
            Some(variable) => variable.clone(),
            None => match name.split_once('.') {
                // pseudo parameters contain `::` but never a dot
                Some((target, attribute)) if !name.contains("::") => {
                    Property::expression(Expression::Attribute {
                        target: target.to_string(),
                        path: attribute.split('.').map(str::to_string).collect(),
                    })
                }
                _ => Property::expression(Expression::Reference(name.to_string())),
            },
        };
        segments.push(Segment::Expression(embedded));
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(json: &str) -> Result<Property, ParseError> {
        let raw: serde_json::Value = serde_json::from_str(json).unwrap();
        Property::parse(&raw, "Resources.R.Properties.P")
    }

    #[test]
    fn plain_map_is_not_an_intrinsic() {
        let property = parse(r#"{"Key": "Owner", "Value": "team"}"#).unwrap();
        let Property::Map(map) = property else {
            panic!("expected a map");
        };
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["Key", "Value"]);
    }

    #[test]
    fn get_att_forms() {
        let expected = Property::expression(Expression::Attribute {
            target: "Db".into(),
            path: vec!["Endpoint".into(), "Address".into()],
        });
        assert_eq!(parse(r#"{"Fn::GetAtt": ["Db", "Endpoint.Address"]}"#).unwrap(), expected);
        assert_eq!(parse(r#"{"Fn::GetAtt": "Db.Endpoint.Address"}"#).unwrap(), expected);
    }

    #[test]
    fn sub_segments() {
        let property = parse(r#"{"Fn::Sub": "app-${Env}-${Bucket.Arn}-${AWS::Region}${!Literal}"}"#)
            .unwrap();
        let Some(Expression::Interpolation { segments, .. }) = property.as_expression() else {
            panic!("expected interpolation");
        };

        assert_eq!(
            segments,
            &vec![
                Segment::Literal("app-".into()),
                Segment::Expression(Property::expression(Expression::Reference("Env".into()))),
                Segment::Literal("-".into()),
                Segment::Expression(Property::expression(Expression::Attribute {
                    target: "Bucket".into(),
                    path: vec!["Arn".into()],
                })),
                Segment::Literal("-".into()),
                Segment::Expression(Property::expression(Expression::Reference(
                    "AWS::Region".into()
                ))),
                Segment::Literal("${Literal}".into()),
            ]
        );
    }

    #[test]
    fn sub_variable_map() {
        let property =
            parse(r#"{"Fn::Sub": ["${Name}-logs", {"Name": {"Ref": "Bucket"}}]}"#).unwrap();
        let Some(Expression::Interpolation { segments, .. }) = property.as_expression() else {
            panic!("expected interpolation");
        };
        assert_eq!(
            segments[0],
            Segment::Expression(Property::expression(Expression::Reference("Bucket".into())))
        );
    }

    #[test]
    fn condition_key_in_policy_is_not_an_intrinsic() {
        let property = parse(r#"{"Condition": {"Bool": {"aws:SecureTransport": "false"}}}"#).unwrap();
        assert!(matches!(property, Property::Map(_)));
    }

    #[test]
    fn unknown_intrinsic_names_the_path() {
        let err = parse(r#"{"Fn::Transmogrify": "x"}"#).unwrap_err();
        assert_eq!(
            err,
            ParseError::UnknownIntrinsic {
                path: "Resources.R.Properties.P.Fn::Transmogrify".into(),
                name: "Fn::Transmogrify".into(),
            }
        );
    }

    #[test]
    fn wrong_arity() {
        let err = parse(r#"{"Fn::Select": [0]}"#).unwrap_err();
        assert!(matches!(err, ParseError::MalformedIntrinsic { .. }));
    }

    #[test]
    fn unterminated_sub() {
        let err = parse(r#"{"Fn::Sub": "broken-${Name"}"#).unwrap_err();
        assert!(matches!(err, ParseError::MalformedIntrinsic { .. }));
    }
}
