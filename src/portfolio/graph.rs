//! Portfolio dependency graph: construction, cycle detection, topological
//! ordering, and dependency-aware batching.
//!
//! Cycle detection uses an iterative tri-color DFS with an explicit stack so
//! portfolio size is never bounded by the call stack.

use crate::environment::Environment;
use crate::errors::OrchestratorError;
use crate::resolver::DomainConfig;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Index into the node list (which preserves input order).
pub type NodeIndex = usize;

#[derive(Debug)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, NodeIndex>,
    /// prerequisite -> domains that depend on it
    dependents: Vec<Vec<NodeIndex>>,
    /// domain -> its prerequisites
    prerequisites: Vec<Vec<NodeIndex>>,
    /// Declared dependencies naming domains outside the portfolio.
    unknown_dependencies: Vec<(String, String)>,
}

impl DependencyGraph {
    /// Build the graph from resolved configs, in the given input order.
    ///
    /// Edges come from explicit `dependencies` plus `shared_with` entries on
    /// shared databases (the owning domain becomes a prerequisite of every
    /// domain it shares with). The graph is verified acyclic before it is
    /// returned.
    pub fn build(
        order: &[String],
        configs: &BTreeMap<String, DomainConfig>,
    ) -> Result<Self, OrchestratorError> {
        let nodes: Vec<String> = order.to_vec();
        let index: HashMap<String, NodeIndex> = nodes
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut prerequisites: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];
        let mut unknown = Vec::new();

        let mut add_edge = |prereq: NodeIndex,
                            dependent: NodeIndex,
                            dependents: &mut Vec<Vec<NodeIndex>>,
                            prerequisites: &mut Vec<Vec<NodeIndex>>| {
            if prereq != dependent && !prerequisites[dependent].contains(&prereq) {
                dependents[prereq].push(dependent);
                prerequisites[dependent].push(prereq);
            }
        };

        for (domain, config) in configs {
            let Some(&dependent) = index.get(domain) else {
                continue;
            };
            for prereq_name in &config.dependencies {
                match index.get(prereq_name) {
                    Some(&prereq) => {
                        add_edge(prereq, dependent, &mut dependents, &mut prerequisites);
                    }
                    None => unknown.push((domain.clone(), prereq_name.clone())),
                }
            }
            // A shared database makes its owner a prerequisite of every
            // domain it is shared with.
            for shared in &config.shared_databases {
                for consumer in &shared.shared_with {
                    match index.get(consumer) {
                        Some(&consumer_index) => add_edge(
                            dependent,
                            consumer_index,
                            &mut dependents,
                            &mut prerequisites,
                        ),
                        None => unknown.push((domain.clone(), consumer.clone())),
                    }
                }
            }
        }

        let graph = Self {
            nodes,
            index,
            dependents,
            prerequisites,
            unknown_dependencies: unknown,
        };
        graph.ensure_acyclic()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: NodeIndex) -> &str {
        &self.nodes[index]
    }

    /// Declared dependencies that point outside the portfolio, as
    /// `(domain, missing prerequisite)` pairs.
    pub fn unknown_dependencies(&self) -> &[(String, String)] {
        &self.unknown_dependencies
    }

    pub fn prerequisites_of(&self, domain: &str) -> Vec<&str> {
        self.index
            .get(domain)
            .map(|&i| {
                self.prerequisites[i]
                    .iter()
                    .map(|&p| self.nodes[p].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Iterative tri-color DFS; returns the first cycle found as a node
    /// path.
    fn find_cycle(&self) -> Option<Vec<NodeIndex>> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;
        let mut color = vec![WHITE; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if color[start] != WHITE {
                continue;
            }
            let mut stack: Vec<(NodeIndex, usize)> = vec![(start, 0)];
            color[start] = GRAY;

            while let Some(&(node, child)) = stack.last() {
                if child < self.dependents[node].len() {
                    stack.last_mut().expect("stack is non-empty").1 += 1;
                    let next = self.dependents[node][child];
                    match color[next] {
                        WHITE => {
                            color[next] = GRAY;
                            stack.push((next, 0));
                        }
                        GRAY => {
                            let from = stack
                                .iter()
                                .position(|&(n, _)| n == next)
                                .expect("gray node is on the stack");
                            let mut cycle: Vec<NodeIndex> =
                                stack[from..].iter().map(|&(n, _)| n).collect();
                            cycle.push(next);
                            return Some(cycle);
                        }
                        _ => {}
                    }
                } else {
                    color[node] = BLACK;
                    stack.pop();
                }
            }
        }
        None
    }

    fn ensure_acyclic(&self) -> Result<(), OrchestratorError> {
        if let Some(cycle) = self.find_cycle() {
            let names: Vec<String> = cycle.iter().map(|&i| self.nodes[i].clone()).collect();
            return Err(OrchestratorError::CircularDependency {
                node: names[0].clone(),
                cycle: names,
            });
        }
        Ok(())
    }

    /// Kahn's algorithm; ties resolve to input order.
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        let mut in_degree: Vec<usize> =
            self.prerequisites.iter().map(|deps| deps.len()).collect();
        let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        order
    }

    /// Segment the topological order into batches of at most `limit`, never
    /// co-scheduling a domain with one of its prerequisites: the batch
    /// closes early instead.
    pub fn batches(&self, limit: usize) -> Vec<Vec<String>> {
        let limit = limit.max(1);
        let mut batches: Vec<Vec<NodeIndex>> = Vec::new();
        let mut current: Vec<NodeIndex> = Vec::new();

        for node in self.topological_order() {
            let conflicts = self.prerequisites[node]
                .iter()
                .any(|prereq| current.contains(prereq));
            if current.len() >= limit || conflicts {
                batches.push(std::mem::take(&mut current));
            }
            current.push(node);
        }
        if !current.is_empty() {
            batches.push(current);
        }

        batches
            .into_iter()
            .map(|batch| batch.into_iter().map(|i| self.nodes[i].clone()).collect())
            .collect()
    }
}

/// Shared managed databases: `(name, environment)` pairs referenced by two
/// or more domains, with the referencing domains.
pub fn shared_database_map(
    configs: &BTreeMap<String, DomainConfig>,
) -> BTreeMap<(String, Environment), BTreeSet<String>> {
    let mut map: BTreeMap<(String, Environment), BTreeSet<String>> = BTreeMap::new();
    for (domain, config) in configs {
        for shared in &config.shared_databases {
            let entry = map
                .entry((shared.name.clone(), shared.environment))
                .or_default();
            entry.insert(domain.clone());
            for consumer in &shared.shared_with {
                entry.insert(consumer.clone());
            }
        }
    }
    map.retain(|_, domains| domains.len() >= 2);
    map
}
