//! Static dependency graph over profiles, services and dependencies.
//!
//! Resolving a profile walks everything reachable from it depth-first, children
//! in sorted order, and emits nodes in post-order: every dependency and upstream
//! service appears before the services that need it. Cycles and dangling
//! references are reported before anything starts.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::Config;
use crate::error::GraphError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Node {
    Profile(String),
    Service(String),
    Dependency(String),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Profile(n) | Node::Service(n) | Node::Dependency(n) => n,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Profile(_) => "profile",
            Node::Service(_) => "service",
            Node::Dependency(_) => "dependency",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind(), self.name())
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Bring-up order for one profile or service. Profiles themselves are not steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub root: Node,
    pub order: Vec<Node>,
}

impl Plan {
    pub fn services(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|n| matches!(n, Node::Service(_)))
            .map(Node::name)
            .collect()
    }

    pub fn dependencies(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|n| matches!(n, Node::Dependency(_)))
            .map(Node::name)
            .collect()
    }

    /// Reverse of the bring-up order.
    pub fn teardown(&self) -> Vec<&Node> {
        self.order.iter().rev().collect()
    }
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

pub struct DependencyGraph<'a> {
    config: &'a Config,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn resolve(&self, profile: &str) -> Result<Plan, GraphError> {
        if !self.config.profiles.contains_key(profile) {
            return Err(GraphError::UnknownProfile(profile.to_string()));
        }
        self.plan_from(Node::Profile(profile.to_string()))
    }

    /// Resolve the upstream closure of a single service.
    pub fn service_plan(&self, service: &str) -> Result<Plan, GraphError> {
        if !self.config.services.contains_key(service) {
            return Err(GraphError::MissingDependency {
                from: "command line".to_string(),
                missing: Node::Service(service.to_string()).to_string(),
            });
        }
        self.plan_from(Node::Service(service.to_string()))
    }

    fn plan_from(&self, root: Node) -> Result<Plan, GraphError> {
        let mut marks = BTreeMap::new();
        let mut stack = Vec::new();
        let mut order = Vec::new();
        self.visit(&root, &mut marks, &mut stack, &mut order)?;
        order.retain(|n| !matches!(n, Node::Profile(_)));
        Ok(Plan { root, order })
    }

    fn visit(
        &self,
        node: &Node,
        marks: &mut BTreeMap<Node, Mark>,
        stack: &mut Vec<Node>,
        order: &mut Vec<Node>,
    ) -> Result<(), GraphError> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| n == node).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(Node::to_string).collect();
                path.push(node.to_string());
                return Err(GraphError::CyclicProfile(path));
            }
            None => {}
        }

        marks.insert(node.clone(), Mark::Visiting);
        stack.push(node.clone());
        for child in self.children(node)? {
            self.visit(&child, marks, stack, order)?;
        }
        stack.pop();
        marks.insert(node.clone(), Mark::Done);
        order.push(node.clone());
        Ok(())
    }

    /// Outgoing edges of `node`, sorted, each checked to be declared.
    fn children(&self, node: &Node) -> Result<Vec<Node>, GraphError> {
        let cfg = self.config;
        let mut out = Vec::new();
        match node {
            Node::Profile(name) => {
                if let Some(p) = cfg.profiles.get(name) {
                    out.extend(p.include.iter().cloned().map(Node::Profile));
                    out.extend(p.services.iter().cloned().map(Node::Service));
                    out.extend(p.dependencies.iter().cloned().map(Node::Dependency));
                }
            }
            Node::Service(name) => {
                if let Some(s) = cfg.services.get(name) {
                    out.extend(s.wait_for.iter().cloned().map(Node::Dependency));
                    out.extend(s.requires.iter().cloned().map(Node::Service));
                }
            }
            Node::Dependency(name) => {
                if let Some(provider) = cfg.dependencies.get(name).and_then(|d| d.provided_by.clone()) {
                    out.push(Node::Service(provider));
                }
            }
        }
        out.sort();
        out.dedup();

        for child in &out {
            let declared = match child {
                Node::Profile(n) => cfg.profiles.contains_key(n),
                Node::Service(n) => cfg.services.contains_key(n),
                Node::Dependency(n) => cfg.dependencies.contains_key(n),
            };
            if !declared {
                return Err(GraphError::MissingDependency {
                    from: node.to_string(),
                    missing: child.to_string(),
                });
            }
        }
        Ok(out)
    }
}
