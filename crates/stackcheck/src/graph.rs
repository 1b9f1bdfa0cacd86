//! Dependency graph builder
//!
//! Edges point from a resource to what it depends on. They come from two places:
//! - references (`Ref`, `Fn::GetAtt`, `${...}`) anywhere in the resource's properties
//! - explicit ordering hints (`DependsOn`)
//!
//! A hint that is already implied by a reference is not added a second time; it is recorded as
//! a [RedundantDependency] instead. Nodes are arena indices into the [Template], never
//! references between nodes.
use crate::error::StructuralError;
use crate::expression::Expression;
use crate::template::{NodeIndex, Template};
use crate::visit::VisitExpressions;
use serde::ser::SerializeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    #[serde(rename = "implicit-via-reference")]
    Reference,
    ExplicitHint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: NodeIndex,
    pub to: NodeIndex,
    pub kind: EdgeKind,
}

/// `DependsOn` entry already enforced by a reference
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RedundantDependency {
    pub resource: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    edges: Vec<DependencyEdge>,
    /// per node: indices into `edges` where the node is `from`
    outgoing: Vec<Vec<usize>>,
    /// per node: indices into `edges` where the node is `to`
    incoming: Vec<Vec<usize>>,
    redundant: Vec<RedundantDependency>,
    order: Vec<NodeIndex>,
}

impl DependencyGraph {
    #[tracing::instrument(skip_all, fields(resources = template.len()))]
    pub fn build(template: &Template) -> Result<Self, StructuralError> {
        let mut graph = DependencyGraph {
            ids: template.resources().iter().map(|node| node.id.clone()).collect(),
            edges: vec![],
            outgoing: vec![vec![]; template.len()],
            incoming: vec![vec![]; template.len()],
            redundant: vec![],
            order: vec![],
        };

        for (from, node) in template.resources().iter().enumerate() {
            let mut targets: Vec<String> = vec![];
            node.properties.visit_expressions(&mut |expression: &Expression| match expression {
                Expression::Reference(target) | Expression::Attribute { target, .. } => {
                    targets.push(target.clone())
                }
                _ => {}
            });

            for target in targets {
                let Some(to) = template.index_of(&target) else {
                    if template.parameters.contains_key(&target) || target.starts_with("AWS::") {
                        continue;
                    }
                    return Err(StructuralError::DanglingReference {
                        from: node.id.clone(),
                        target,
                    });
                };
                graph.add_edge(from, to, EdgeKind::Reference);
            }

            for target in &node.depends_on {
                let Some(to) = template.index_of(target) else {
                    return Err(StructuralError::DanglingReference {
                        from: node.id.clone(),
                        target: target.clone(),
                    });
                };

                match graph.edge_between(from, to).map(|edge| edge.kind) {
                    Some(EdgeKind::Reference) => {
                        let finding = RedundantDependency {
                            resource: node.id.clone(),
                            target: target.clone(),
                        };
                        // one finding per pair, however often the hint is listed
                        if !graph.redundant.contains(&finding) {
                            tracing::debug!(resource = %node.id, target = %target, "dependency already implied by a reference");
                            graph.redundant.push(finding);
                        }
                    }
                    Some(EdgeKind::ExplicitHint) => {}
                    None => graph.add_edge(from, to, EdgeKind::ExplicitHint),
                }
            }
        }

        graph.order = graph.sort()?;

        tracing::debug!(
            edges = graph.edges.len(),
            redundant = graph.redundant.len(),
            "dependency graph built"
        );
        Ok(graph)
    }

    /// Adds the edge unless one already connects the pair
    fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, kind: EdgeKind) {
        if self.edge_between(from, to).is_some() {
            return;
        }

        let edge = self.edges.len();
        self.edges.push(DependencyEdge { from, to, kind });
        self.outgoing[from].push(edge);
        self.incoming[to].push(edge);
    }

    /// Depth-first post-order; a back edge to a node on the current path is a cycle
    fn sort(&self) -> Result<Vec<NodeIndex>, StructuralError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnPath,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.ids.len()];
        let mut order = Vec::with_capacity(self.ids.len());

        for root in 0..self.ids.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }

            // (node, position of the next outgoing edge to follow)
            let mut path = vec![(root, 0usize)];
            marks[root] = Mark::OnPath;

            while let Some((node, next)) = path.last_mut() {
                let node = *node;
                let Some(&edge) = self.outgoing[node].get(*next) else {
                    marks[node] = Mark::Done;
                    order.push(node);
                    path.pop();
                    continue;
                };
                *next += 1;

                let to = self.edges[edge].to;
                match marks[to] {
                    Mark::Done => {}
                    Mark::Unvisited => {
                        marks[to] = Mark::OnPath;
                        path.push((to, 0));
                    }
                    Mark::OnPath => {
                        let start = path
                            .iter()
                            .position(|(entry, _)| *entry == to)
                            .unwrap_or_default();
                        return Err(StructuralError::DependencyCycle {
                            cycle: path[start..]
                                .iter()
                                .map(|(entry, _)| self.ids[*entry].clone())
                                .collect(),
                        });
                    }
                }
            }
        }

        Ok(order)
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn edge_between(&self, from: NodeIndex, to: NodeIndex) -> Option<&DependencyEdge> {
        self.outgoing[from]
            .iter()
            .map(|edge| &self.edges[*edge])
            .find(|edge| edge.to == to)
    }

    /// What `index` depends on
    pub fn dependencies(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.outgoing[index].iter().map(|edge| self.edges[*edge].to)
    }

    /// What depends on `index`
    pub fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.incoming[index].iter().map(|edge| self.edges[*edge].from)
    }

    pub fn redundant(&self) -> &[RedundantDependency] {
        &self.redundant
    }

    /// Every node after all of its dependencies
    pub fn topological_order(&self) -> &[NodeIndex] {
        &self.order
    }

    pub fn id(&self, index: NodeIndex) -> &str {
        &self.ids[index]
    }
}

impl serde::Serialize for DependencyGraph {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(serde::Serialize)]
        struct Target<'a> {
            target: &'a str,
            kind: EdgeKind,
        }

        let mut ser = serializer.serialize_map(Some(self.ids.len()))?;
        for &index in &self.order {
            let targets = self.outgoing[index]
                .iter()
                .map(|edge| Target {
                    target: &self.ids[self.edges[*edge].to],
                    kind: self.edges[*edge].kind,
                })
                .collect::<Vec<_>>();
            ser.serialize_entry(&self.ids[index], &targets)?;
        }
        ser.end()
    }
}
