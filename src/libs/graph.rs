// Dependency graph resolver.
// Builds a DAG over the manifest's resources and produces parallel-safe
// layers: for every edge a -> b (a depends on b), b lands in a strictly
// earlier layer. The layer index is the longest-path distance from a leaf,
// computed with a Kahn-style pass over in-degrees. Within a layer, nodes
// sort by kind priority (runtimes before installers before repositories
// before tools) and then by name, so execution order is deterministic.
//
// Edges may point at resources added later (forward declarations) and at
// the builtin installers, which are materialized implicitly. Anything
// else unresolved is a graph error, as is any cycle; `validate` and
// `resolve` agree on both.

use crate::libs::errors::EnvboxError;
use crate::log_debug;
use crate::schemas::resource::{BUILTIN_INSTALLERS, Kind, Ref, Resource};
use colored::Colorize;
use std::collections::{BTreeMap, BTreeSet};

/// A set of resources with no edges among them, safe to run in parallel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub nodes: Vec<Ref>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<Ref>,
    /// Builtin installer nodes materialized because an edge pointed at them.
    builtins: BTreeSet<Ref>,
    /// dependent -> set of dependencies.
    edges: BTreeMap<Ref, BTreeSet<Ref>>,
}

impl DependencyGraph {
    pub fn new() -> DependencyGraph {
        DependencyGraph::default()
    }

    /// Builds the graph for a manifest set. Tool sets must already be
    /// expanded; their nodes would never execute.
    pub fn from_resources(resources: &[Resource]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for resource in resources {
            graph.add_node(resource.reference());
        }
        for resource in resources {
            let from = resource.reference();
            for dependency in resource.dependencies() {
                graph.add_edge(from.clone(), dependency);
            }
        }
        graph
    }

    pub fn add_node(&mut self, reference: Ref) {
        // A manifest entry supersedes a previously materialized builtin.
        self.builtins.remove(&reference);
        self.nodes.insert(reference);
    }

    /// Records `from` depending on `to`. The target may be added later or
    /// be a builtin installer; unresolved targets are reported when the
    /// graph is validated or resolved.
    pub fn add_edge(&mut self, from: Ref, to: Ref) {
        if !self.nodes.contains(&to) && is_builtin(&to) {
            log_debug!("[Graph] Materializing builtin installer node {}", to.to_string().cyan());
            self.builtins.insert(to.clone());
        }
        self.edges.entry(from).or_default().insert(to);
    }

    /// Whether `reference` was materialized as a builtin rather than
    /// declared in the manifest.
    pub fn is_builtin_node(&self, reference: &Ref) -> bool {
        self.builtins.contains(reference)
    }

    fn all_nodes(&self) -> BTreeSet<Ref> {
        self.nodes.union(&self.builtins).cloned().collect()
    }

    /// Checks that every edge target resolves and that the graph is
    /// acyclic, without producing layers. Agrees with `resolve`: both
    /// succeed or both fail with the same class of error.
    pub fn validate(&self) -> Result<(), EnvboxError> {
        self.resolve().map(|_| ())
    }

    /// Produces the ordered layers. Fails on unresolved dependencies and
    /// on cycles.
    pub fn resolve(&self) -> Result<Vec<Layer>, EnvboxError> {
        let nodes = self.all_nodes();

        // Both endpoints of every edge must be known nodes at this point.
        for (from, deps) in &self.edges {
            if !nodes.contains(from) {
                return Err(EnvboxError::Graph(format!(
                    "unresolved dependency: edges declared for {from}, which is not in the manifest set"
                )));
            }
            for to in deps {
                if !nodes.contains(to) {
                    return Err(EnvboxError::Graph(format!(
                        "unresolved dependency: {from} depends on {to}, which is not in the manifest set"
                    )));
                }
            }
        }

        // Kahn over in-degrees, assigning each node the longest-path
        // distance from a leaf. depth[n] = 1 + max(depth of dependencies).
        let mut remaining_deps: BTreeMap<&Ref, BTreeSet<&Ref>> = nodes
            .iter()
            .map(|n| {
                let deps: BTreeSet<&Ref> = self
                    .edges
                    .get(n)
                    .map(|d| d.iter().collect())
                    .unwrap_or_default();
                (n, deps)
            })
            .collect();
        // dependency -> dependents, for propagation.
        let mut dependents: BTreeMap<&Ref, Vec<&Ref>> = BTreeMap::new();
        for (from, deps) in &self.edges {
            for to in deps {
                dependents.entry(to).or_default().push(from);
            }
        }

        let mut depth: BTreeMap<&Ref, usize> = BTreeMap::new();
        let mut ready: Vec<&Ref> = remaining_deps
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(n, _)| *n)
            .collect();
        for node in &ready {
            depth.insert(*node, 0);
        }

        let mut processed = 0usize;
        while let Some(node) = ready.pop() {
            processed += 1;
            let node_depth = depth[&node];
            for dependent in dependents.get(&node).cloned().unwrap_or_default() {
                let entry = depth.entry(dependent).or_insert(0);
                *entry = (*entry).max(node_depth + 1);
                let deps = remaining_deps.get_mut(&dependent).expect("known node");
                deps.remove(node);
                if deps.is_empty() {
                    ready.push(dependent);
                }
            }
        }

        if processed != nodes.len() {
            let cycle = self.describe_cycle(&nodes);
            return Err(EnvboxError::Graph(format!(
                "circular dependency detected: {cycle}"
            )));
        }

        // Bucket nodes by depth, then order each layer by (kind priority,
        // name).
        let layer_count = depth.values().copied().max().map(|d| d + 1).unwrap_or(0);
        let mut layers: Vec<Layer> = (0..layer_count).map(|_| Layer { nodes: Vec::new() }).collect();
        for (node, node_depth) in &depth {
            layers[*node_depth].nodes.push((*node).clone());
        }
        for layer in &mut layers {
            layer
                .nodes
                .sort_by(|a, b| (a.kind.priority(), &a.name).cmp(&(b.kind.priority(), &b.name)));
        }
        log_debug!(
            "[Graph] Resolved {} node(s) into {} layer(s)",
            nodes.len(),
            layers.len()
        );
        Ok(layers)
    }

    /// Walks the leftover cyclic subgraph to present one concrete cycle
    /// in the error message.
    fn describe_cycle(&self, nodes: &BTreeSet<Ref>) -> String {
        // Any node on a cycle can be found by following edges from a node
        // until one repeats; nodes off the cycle terminate early.
        for start in nodes {
            let mut path: Vec<&Ref> = Vec::new();
            let mut seen: BTreeSet<&Ref> = BTreeSet::new();
            let mut current = start;
            loop {
                if let Some(position) = path.iter().position(|n| *n == current) {
                    let cycle: Vec<String> =
                        path[position..].iter().map(|n| n.to_string()).collect();
                    return format!("{} -> {}", cycle.join(" -> "), current);
                }
                if !seen.insert(current) {
                    break;
                }
                path.push(current);
                // Follow the first outgoing edge; deterministic because the
                // edge sets are ordered.
                match self.edges.get(current).and_then(|deps| deps.iter().next()) {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }
        "(cycle could not be reconstructed)".to_string()
    }
}

fn is_builtin(reference: &Ref) -> bool {
    reference.kind == Kind::Installer && BUILTIN_INSTALLERS.contains(&reference.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(edges: &[(&str, &str)], nodes: &[&str]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for node in nodes {
            graph.add_node(node.parse().unwrap());
        }
        for (from, to) in edges {
            graph.add_edge(from.parse().unwrap(), to.parse().unwrap());
        }
        graph
    }

    #[test]
    fn builtin_installer_resolves_without_manifest_entry() {
        let graph = graph_of(&[("tool/ripgrep", "installer/download")], &["tool/ripgrep"]);
        let layers = graph.resolve().unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].nodes, vec!["installer/download".parse::<Ref>().unwrap()]);
        assert_eq!(layers[1].nodes, vec!["tool/ripgrep".parse::<Ref>().unwrap()]);
    }

    #[test]
    fn unresolved_dependency_is_an_error() {
        let graph = graph_of(&[("tool/gopls", "runtime/go")], &["tool/gopls"]);
        let err = graph.resolve().unwrap_err();
        assert!(matches!(err, EnvboxError::Graph(_)));
        assert!(err.to_string().contains("unresolved dependency"));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn forward_declared_edges_materialize() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("tool/gopls".parse().unwrap(), "runtime/go".parse().unwrap());
        graph.add_node("tool/gopls".parse().unwrap());
        // The runtime arrives after the edge pointing at it.
        graph.add_node("runtime/go".parse().unwrap());
        let layers = graph.resolve().unwrap();
        assert_eq!(layers.len(), 2);
    }

    #[test]
    fn cycle_detection_names_the_cycle() {
        let graph = graph_of(
            &[("tool/a", "installer/b"), ("installer/b", "tool/a")],
            &["tool/a", "installer/b"],
        );
        let err = graph.resolve().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("circular dependency"));
        assert!(message.contains("tool/a"));
        assert!(message.contains("installer/b"));
        // validate agrees with resolve.
        assert!(graph.validate().is_err());
    }

    #[test]
    fn layer_index_is_longest_path() {
        // c -> b -> a and c -> a: c must land above b even though it also
        // has a direct edge to the leaf.
        let graph = graph_of(
            &[
                ("tool/c", "installer/b"),
                ("installer/b", "runtime/a"),
                ("tool/c", "runtime/a"),
            ],
            &["tool/c", "installer/b", "runtime/a"],
        );
        let layers = graph.resolve().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].nodes[0].name, "a");
        assert_eq!(layers[1].nodes[0].name, "b");
        assert_eq!(layers[2].nodes[0].name, "c");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// An arbitrary acyclic resource universe: node i may only depend
        /// on nodes with a smaller index, so cycles cannot arise by
        /// construction.
        fn arbitrary_dag() -> impl Strategy<Value = (Vec<Ref>, Vec<(usize, usize)>)> {
            (2usize..24).prop_flat_map(|count| {
                let nodes: Vec<Ref> = (0..count)
                    .map(|i| {
                        let kind = match i % 3 {
                            0 => Kind::Runtime,
                            1 => Kind::Installer,
                            _ => Kind::Tool,
                        };
                        Ref::new(kind, format!("node{i:02}"))
                    })
                    .collect();
                let edges = proptest::collection::vec((1..count, 0usize..count), 0..count * 2)
                    .prop_map(|pairs| {
                        pairs
                            .into_iter()
                            .filter(|(from, to)| to < from)
                            .collect::<Vec<_>>()
                    });
                (Just(nodes), edges)
            })
        }

        fn build(nodes: &[Ref], edges: &[(usize, usize)]) -> DependencyGraph {
            let mut graph = DependencyGraph::new();
            for node in nodes {
                graph.add_node(node.clone());
            }
            for (from, to) in edges {
                graph.add_edge(nodes[*from].clone(), nodes[*to].clone());
            }
            graph
        }

        fn layer_of(layers: &[Layer], node: &Ref) -> usize {
            layers
                .iter()
                .position(|layer| layer.nodes.contains(node))
                .expect("every node appears in a layer")
        }

        proptest! {
            #[test]
            fn every_edge_points_to_an_earlier_layer((nodes, edges) in arbitrary_dag()) {
                let layers = build(&nodes, &edges).resolve().unwrap();
                for (from, to) in &edges {
                    prop_assert!(
                        layer_of(&layers, &nodes[*from]) > layer_of(&layers, &nodes[*to])
                    );
                }
            }

            #[test]
            fn every_node_appears_in_exactly_one_layer((nodes, edges) in arbitrary_dag()) {
                let layers = build(&nodes, &edges).resolve().unwrap();
                let total: usize = layers.iter().map(|l| l.nodes.len()).sum();
                prop_assert_eq!(total, nodes.len());
                for node in &nodes {
                    let occurrences = layers
                        .iter()
                        .filter(|layer| layer.nodes.contains(node))
                        .count();
                    prop_assert_eq!(occurrences, 1);
                }
            }

            #[test]
            fn no_two_nodes_in_a_layer_share_an_edge((nodes, edges) in arbitrary_dag()) {
                let layers = build(&nodes, &edges).resolve().unwrap();
                for (from, to) in &edges {
                    prop_assert_ne!(
                        layer_of(&layers, &nodes[*from]),
                        layer_of(&layers, &nodes[*to])
                    );
                }
            }

            #[test]
            fn dependency_free_runtimes_land_in_layer_zero((nodes, edges) in arbitrary_dag()) {
                let layers = build(&nodes, &edges).resolve().unwrap();
                for (index, node) in nodes.iter().enumerate() {
                    let has_deps = edges.iter().any(|(from, _)| *from == index);
                    if node.kind == Kind::Runtime && !has_deps {
                        prop_assert_eq!(layer_of(&layers, node), 0);
                    }
                }
            }

            #[test]
            fn in_layer_order_is_non_decreasing((nodes, edges) in arbitrary_dag()) {
                let layers = build(&nodes, &edges).resolve().unwrap();
                for layer in &layers {
                    let keys: Vec<(u32, &String)> = layer
                        .nodes
                        .iter()
                        .map(|n| (n.kind.priority(), &n.name))
                        .collect();
                    let mut sorted = keys.clone();
                    sorted.sort();
                    prop_assert_eq!(keys, sorted);
                }
            }

            #[test]
            fn validate_agrees_with_resolve((nodes, edges) in arbitrary_dag()) {
                let graph = build(&nodes, &edges);
                prop_assert_eq!(graph.validate().is_ok(), graph.resolve().is_ok());
            }
        }
    }

    #[test]
    fn in_layer_order_is_kind_priority_then_name() {
        let graph = graph_of(
            &[],
            &["tool/zeta", "tool/alpha", "runtime/go", "installer/download"],
        );
        let layers = graph.resolve().unwrap();
        assert_eq!(layers.len(), 1);
        let names: Vec<String> = layers[0].nodes.iter().map(|n| n.to_string()).collect();
        assert_eq!(
            names,
            vec!["runtime/go", "installer/download", "tool/alpha", "tool/zeta"]
        );
    }
}
