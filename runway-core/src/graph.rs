//! Asset dependency graph
//!
//! Holds asset definitions as petgraph nodes and dependency edges weighted by
//! their [`PartitionMapping`]. Every mutation keeps the graph acyclic: an edge
//! that would close a cycle is rejected and the graph is left untouched.
//!
//! The graph is built once at configuration load and then shared immutably
//! (behind an `Arc`) by the resolver, scheduler and backfill controller.

use crate::asset::AssetNode;
use crate::partition::{PartitionKey, PartitionRef};
use crate::partition_mapping::{infer_mapping, PartitionMapping, PartitionMappingError};
use chrono::NaiveDate;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};

/// Errors raised while building or querying the graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Asset already exists: {0}")]
    DuplicateAsset(String),

    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    #[error("Dependency {from} -> {to} would create a cycle")]
    Cycle { from: String, to: String },

    #[error("Dependency {from} -> {to} declared more than once")]
    DuplicateEdge { from: String, to: String },

    #[error("Dependency {from} -> {to} has an incompatible partition mapping: {source}")]
    IncompatibleMapping {
        from: String,
        to: String,
        #[source]
        source: PartitionMappingError,
    },
}

/// A dependency edge as seen from one endpoint
#[derive(Debug, Clone, Copy)]
pub struct Dependency<'a> {
    /// The asset on the other end of the edge
    pub asset: &'a AssetNode,
    pub mapping: &'a PartitionMapping,
}

/// Directed acyclic graph of assets
#[derive(Debug, Clone, Default)]
pub struct AssetGraph {
    graph: DiGraph<AssetNode, PartitionMapping>,
    index: HashMap<String, NodeIndex>,
}

impl AssetGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset. Names are unique.
    pub fn register(&mut self, node: AssetNode) -> Result<(), GraphError> {
        if self.index.contains_key(&node.name) {
            return Err(GraphError::DuplicateAsset(node.name));
        }
        let name = node.name.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(name, idx);
        Ok(())
    }

    /// Add a dependency `from -> to` (`to` reads `from`).
    ///
    /// Rejects unknown assets, duplicate edges, incompatible mappings and any
    /// edge that would close a cycle. Cycle detection is a reachability check
    /// from `to` back to `from`; the graph is unchanged on error.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        mapping: PartitionMapping,
    ) -> Result<(), GraphError> {
        let from_idx = self.node_index(from)?;
        let to_idx = self.node_index(to)?;

        if from_idx == to_idx || has_path_connecting(&self.graph, to_idx, from_idx, None) {
            return Err(GraphError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        if self.graph.find_edge(from_idx, to_idx).is_some() {
            return Err(GraphError::DuplicateEdge {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        mapping
            .validate_compatibility(&self.graph[from_idx].partitions, &self.graph[to_idx].partitions)
            .map_err(|source| GraphError::IncompatibleMapping {
                from: from.to_string(),
                to: to.to_string(),
                source,
            })?;

        self.graph.add_edge(from_idx, to_idx, mapping);
        Ok(())
    }

    /// Add a dependency with a mapping inferred from both partition dimensions
    pub fn add_inferred_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let from_idx = self.node_index(from)?;
        let to_idx = self.node_index(to)?;
        let mapping = infer_mapping(
            &self.graph[from_idx].partitions,
            &self.graph[to_idx].partitions,
        )
        .map_err(|source| GraphError::IncompatibleMapping {
            from: from.to_string(),
            to: to.to_string(),
            source,
        })?;
        self.add_edge(from, to, mapping)
    }

    pub fn get(&self, name: &str) -> Option<&AssetNode> {
        self.index.get(name).map(|idx| &self.graph[*idx])
    }

    /// Look up an asset, failing with `UnknownAsset`
    pub fn node(&self, name: &str) -> Result<&AssetNode, GraphError> {
        self.get(name)
            .ok_or_else(|| GraphError::UnknownAsset(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All assets sorted by name
    pub fn assets(&self) -> Vec<&AssetNode> {
        let mut nodes: Vec<&AssetNode> = self.graph.node_weights().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Direct upstream dependencies of `name`, sorted by name
    pub fn upstream(&self, name: &str) -> Result<Vec<Dependency<'_>>, GraphError> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct downstream dependents of `name`, sorted by name
    pub fn downstream(&self, name: &str) -> Result<Vec<Dependency<'_>>, GraphError> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Result<Vec<Dependency<'_>>, GraphError> {
        let idx = self.node_index(name)?;
        let mut deps: Vec<Dependency<'_>> = self
            .graph
            .edges_directed(idx, direction)
            .map(|edge| {
                let other = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                Dependency {
                    asset: &self.graph[other],
                    mapping: edge.weight(),
                }
            })
            .collect();
        deps.sort_by(|a, b| a.asset.name.cmp(&b.asset.name));
        Ok(deps)
    }

    /// Every asset reachable downstream from `names`, excluding the roots
    pub fn descendants<S: AsRef<str>>(&self, names: &[S]) -> Result<BTreeSet<String>, GraphError> {
        self.closure(names, Direction::Outgoing)
    }

    /// Every asset reachable upstream from `names`, excluding the roots
    pub fn ancestors<S: AsRef<str>>(&self, names: &[S]) -> Result<BTreeSet<String>, GraphError> {
        self.closure(names, Direction::Incoming)
    }

    fn closure<S: AsRef<str>>(
        &self,
        names: &[S],
        direction: Direction,
    ) -> Result<BTreeSet<String>, GraphError> {
        let mut queue = VecDeque::new();
        let mut seen = BTreeSet::new();
        for name in names {
            queue.push_back(self.node_index(name.as_ref())?);
        }
        let roots: Vec<NodeIndex> = queue.iter().copied().collect();

        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, direction) {
                if seen.insert(self.graph[next].name.clone()) {
                    queue.push_back(next);
                }
            }
        }

        for root in roots {
            seen.remove(&self.graph[root].name);
        }
        Ok(seen)
    }

    /// Assets in dependency order.
    ///
    /// Kahn's algorithm with a min-heap on asset name, so assets whose
    /// dependencies are satisfied at the same time come out alphabetically.
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(&str, NodeIndex)>> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(idx, _)| Reverse((self.graph[*idx].name.as_str(), *idx)))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((name, idx))) = ready.pop() {
            order.push(name.to_string());
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        ready.push(Reverse((self.graph[next].name.as_str(), next)));
                    }
                }
            }
        }
        order
    }

    /// Upstream partitions read by one partition of `asset`, grouped by edge
    /// and sorted
    pub fn upstream_partitions(
        &self,
        asset: &str,
        key: &PartitionKey,
        today: NaiveDate,
    ) -> Result<Vec<PartitionRef>, GraphError> {
        let mut refs = Vec::new();
        for dep in self.upstream(asset)? {
            for upstream_key in dep
                .mapping
                .upstream_partitions(key, &dep.asset.partitions, today)
            {
                refs.push(PartitionRef::new(dep.asset.name.clone(), upstream_key));
            }
        }
        refs.sort();
        refs.dedup();
        Ok(refs)
    }

    /// Direct downstream partitions that read one partition of `asset`
    pub fn downstream_partitions(
        &self,
        asset: &str,
        key: &PartitionKey,
        today: NaiveDate,
    ) -> Result<Vec<PartitionRef>, GraphError> {
        let mut refs = Vec::new();
        for dep in self.downstream(asset)? {
            for downstream_key in
                dep.mapping
                    .downstream_partitions(key, &dep.asset.partitions, today)
            {
                refs.push(PartitionRef::new(dep.asset.name.clone(), downstream_key));
            }
        }
        refs.sort();
        refs.dedup();
        Ok(refs)
    }

    fn node_index(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownAsset(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::PartitionDimension;

    fn daily(name: &str) -> AssetNode {
        AssetNode::builder(name)
            .partitioned_daily(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .build()
    }

    fn flights_graph() -> AssetGraph {
        let mut graph = AssetGraph::new();
        graph.register(daily("raw_flights")).unwrap();
        graph.register(daily("cleaned_flights")).unwrap();
        graph.register(daily("daily_metrics")).unwrap();
        graph
            .add_edge("raw_flights", "cleaned_flights", PartitionMapping::Identity)
            .unwrap();
        graph
            .add_edge("cleaned_flights", "daily_metrics", PartitionMapping::Identity)
            .unwrap();
        graph
    }

    #[test]
    fn test_duplicate_asset_rejected() {
        let mut graph = AssetGraph::new();
        graph.register(AssetNode::new("a")).unwrap();
        assert_eq!(
            graph.register(AssetNode::new("a")),
            Err(GraphError::DuplicateAsset("a".to_string()))
        );
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_unknown_asset_rejected() {
        let mut graph = AssetGraph::new();
        graph.register(AssetNode::new("a")).unwrap();
        assert_eq!(
            graph.add_edge("a", "missing", PartitionMapping::Identity),
            Err(GraphError::UnknownAsset("missing".to_string()))
        );
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let mut graph = flights_graph();
        let edges_before = graph.edge_count();
        let order_before = graph.topological_order();

        let result = graph.add_edge("daily_metrics", "raw_flights", PartitionMapping::Identity);
        assert!(matches!(result, Err(GraphError::Cycle { .. })));
        assert_eq!(graph.edge_count(), edges_before);
        assert_eq!(graph.topological_order(), order_before);
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut graph = AssetGraph::new();
        graph.register(AssetNode::new("a")).unwrap();
        assert!(matches!(
            graph.add_edge("a", "a", PartitionMapping::Identity),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_incompatible_mapping_rejected() {
        let mut graph = AssetGraph::new();
        graph.register(daily("raw_flights")).unwrap();
        graph.register(AssetNode::new("summary")).unwrap();

        assert!(matches!(
            graph.add_edge("raw_flights", "summary", PartitionMapping::Identity),
            Err(GraphError::IncompatibleMapping { .. })
        ));
        assert_eq!(graph.edge_count(), 0);
        graph.add_inferred_edge("raw_flights", "summary").unwrap();
        let upstream = graph.upstream("summary").unwrap();
        assert_eq!(upstream[0].mapping, &PartitionMapping::AllPartitions);
    }

    #[test]
    fn test_duplicate_edge_rejected() {
        let mut graph = flights_graph();
        assert!(matches!(
            graph.add_edge("raw_flights", "cleaned_flights", PartitionMapping::Identity),
            Err(GraphError::DuplicateEdge { .. })
        ));
    }

    #[test]
    fn test_topological_order_breaks_ties_by_name() {
        let mut graph = AssetGraph::new();
        for name in ["weather", "airports", "flights", "enriched"] {
            graph.register(AssetNode::new(name)).unwrap();
        }
        graph.add_edge("weather", "enriched", PartitionMapping::Identity).unwrap();
        graph.add_edge("flights", "enriched", PartitionMapping::Identity).unwrap();
        graph.add_edge("airports", "enriched", PartitionMapping::Identity).unwrap();

        assert_eq!(
            graph.topological_order(),
            vec!["airports", "flights", "weather", "enriched"]
        );
    }

    #[test]
    fn test_upstream_and_downstream_queries() {
        let graph = flights_graph();
        let upstream = graph.upstream("cleaned_flights").unwrap();
        assert_eq!(upstream.len(), 1);
        assert_eq!(upstream[0].asset.name, "raw_flights");

        let downstream = graph.downstream("cleaned_flights").unwrap();
        assert_eq!(downstream[0].asset.name, "daily_metrics");

        assert_eq!(
            graph.descendants(&["raw_flights"]).unwrap(),
            BTreeSet::from(["cleaned_flights".to_string(), "daily_metrics".to_string()])
        );
        assert_eq!(
            graph.ancestors(&["daily_metrics"]).unwrap(),
            BTreeSet::from(["cleaned_flights".to_string(), "raw_flights".to_string()])
        );
    }

    #[test]
    fn test_partition_level_neighbors() {
        let mut graph = flights_graph();
        graph.register(AssetNode::new("airports")).unwrap();
        graph
            .add_edge("airports", "cleaned_flights", PartitionMapping::Identity)
            .unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();

        let upstream = graph
            .upstream_partitions("cleaned_flights", &"2024-03-02".into(), today)
            .unwrap();
        assert_eq!(
            upstream,
            vec![
                PartitionRef::new("airports", PartitionKey::unpartitioned()),
                PartitionRef::new("raw_flights", "2024-03-02"),
            ]
        );

        let downstream = graph
            .downstream_partitions("airports", &PartitionKey::unpartitioned(), today)
            .unwrap();
        assert_eq!(downstream.len(), 5);
        assert!(downstream
            .iter()
            .all(|p| p.asset == "cleaned_flights"));
    }

    #[test]
    fn test_assets_sorted() {
        let graph = flights_graph();
        let names: Vec<&str> = graph.assets().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["cleaned_flights", "daily_metrics", "raw_flights"]);
        assert!(matches!(
            graph.get("raw_flights").map(|a| &a.partitions),
            Some(PartitionDimension::Daily { .. })
        ));
    }
}
