use super::Visit;
use crate::expression::{Expression, Property, Segment};

/// Recursively visit all [Expression]s, outermost first
pub trait VisitExpressions {
    fn visit_expressions(&self, visitor: &mut dyn Visit<Expression>);
}

impl VisitExpressions for Property {
    fn visit_expressions(&self, visitor: &mut dyn Visit<Expression>) {
        match self {
            Property::Literal(_) => {}
            Property::List(items) => {
                for item in items {
                    item.visit_expressions(visitor);
                }
            }
            Property::Map(map) => {
                for value in map.values() {
                    value.visit_expressions(visitor);
                }
            }
            Property::Expression(expression) => expression.visit_expressions(visitor),
        }
    }
}

impl VisitExpressions for Expression {
    fn visit_expressions(&self, visitor: &mut dyn Visit<Expression>) {
        visitor.visit(self);

        match self {
            Expression::Reference(_) | Expression::Attribute { .. } | Expression::Condition(_) => {}
            Expression::Interpolation { segments, .. } => {
                for segment in segments {
                    if let Segment::Expression(embedded) = segment {
                        embedded.visit_expressions(visitor);
                    }
                }
            }
            Expression::Join { items, .. } => items.visit_expressions(visitor),
            Expression::Lookup { map, keys } => {
                map.visit_expressions(visitor);
                keys.iter().for_each(|key| key.visit_expressions(visitor));
            }
            Expression::Select { index, list } => {
                index.visit_expressions(visitor);
                list.visit_expressions(visitor);
            }
            Expression::Split { source, .. } => source.visit_expressions(visitor),
            // both branches count: either may be taken at deploy time
            Expression::If { then, otherwise, .. } => {
                then.visit_expressions(visitor);
                otherwise.visit_expressions(visitor);
            }
            Expression::Equals(left, right) => {
                left.visit_expressions(visitor);
                right.visit_expressions(visitor);
            }
            Expression::And(operands) | Expression::Or(operands) => {
                operands.iter().for_each(|operand| operand.visit_expressions(visitor));
            }
            Expression::Not(operand)
            | Expression::Import(operand)
            | Expression::AvailabilityZones(operand)
            | Expression::Base64(operand) => operand.visit_expressions(visitor),
        }
    }
}

impl<K> VisitExpressions for indexmap::IndexMap<K, Property> {
    fn visit_expressions(&self, visitor: &mut dyn Visit<Expression>) {
        for property in self.values() {
            property.visit_expressions(visitor);
        }
    }
}
