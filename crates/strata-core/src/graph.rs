//! Static asset dependency graph.
//!
//! An edge `A → B` means "B is derived from A": B's run for a partition date
//! may start only once A's run for that date has succeeded. The graph is
//! declared once, validated at construction and never mutated afterwards.
//!
//! Topological ordering uses Kahn's algorithm; cycles are caught at edge
//! insertion with a DFS and the offending edge is rolled back.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use strata_state::AssetId;

use crate::schedule::CronSchedule;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", assets.join(" -> "))]
    Cycle { assets: Vec<String> },

    #[error("asset declared twice: {asset}")]
    DuplicateAsset { asset: String },

    #[error("unknown asset: {asset}")]
    UnknownAsset { asset: String },

    #[error("cron asset {asset} must not declare upstream assets")]
    CronWithUpstream { asset: String },

    #[error("eager asset {asset} needs at least one upstream asset")]
    EagerWithoutUpstream { asset: String },

    #[error("{asset} cannot depend on {upstream} from a later layer")]
    LayerInversion { asset: String, upstream: String },
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// How an asset's runs come into existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerKind {
    /// Root asset fired by the clock. Each tick materializes the partition
    /// dated `tick date - partition_lag_days`.
    Cron {
        schedule: CronSchedule,
        partition_lag_days: u32,
    },
    /// Derived asset fired when all upstream runs for a date have succeeded.
    Eager,
}

/// A declared asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetNode {
    pub id: AssetId,
    pub trigger: TriggerKind,
    pub upstream: Vec<AssetId>,
}

impl AssetNode {
    pub fn cron(id: AssetId, schedule: CronSchedule, partition_lag_days: u32) -> Self {
        Self {
            id,
            trigger: TriggerKind::Cron {
                schedule,
                partition_lag_days,
            },
            upstream: Vec::new(),
        }
    }

    pub fn eager(id: AssetId, upstream: Vec<AssetId>) -> Self {
        Self {
            id,
            trigger: TriggerKind::Eager,
            upstream,
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.trigger, TriggerKind::Cron { .. })
    }
}

/// Validated DAG of assets.
#[derive(Debug, Clone, Default)]
pub struct AssetGraph {
    nodes: BTreeMap<AssetId, AssetNode>,
    /// `upstream → {derived, ...}`
    downstream: BTreeMap<AssetId, BTreeSet<AssetId>>,
    /// `derived → {upstream, ...}`
    upstream: BTreeMap<AssetId, BTreeSet<AssetId>>,
}

impl AssetGraph {
    /// Build and validate a graph. Rejects duplicates, unknown upstreams,
    /// trigger/upstream mismatches, layer inversions and cycles.
    pub fn from_nodes(nodes: impl IntoIterator<Item = AssetNode>) -> GraphResult<Self> {
        let mut graph = AssetGraph::default();
        let mut declared = Vec::new();

        for node in nodes {
            if graph.nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateAsset {
                    asset: node.id.to_string(),
                });
            }
            match (&node.trigger, node.upstream.is_empty()) {
                (TriggerKind::Cron { .. }, false) => {
                    return Err(GraphError::CronWithUpstream {
                        asset: node.id.to_string(),
                    })
                }
                (TriggerKind::Eager, true) => {
                    return Err(GraphError::EagerWithoutUpstream {
                        asset: node.id.to_string(),
                    })
                }
                _ => {}
            }
            graph.downstream.entry(node.id.clone()).or_default();
            graph.upstream.entry(node.id.clone()).or_default();
            declared.push((node.id.clone(), node.upstream.clone()));
            graph.nodes.insert(node.id.clone(), node);
        }

        for (id, upstream) in declared {
            for up in upstream {
                graph.add_dependency(&up, &id)?;
            }
        }
        Ok(graph)
    }

    fn add_dependency(&mut self, dependency: &AssetId, dependent: &AssetId) -> GraphResult<()> {
        if !self.nodes.contains_key(dependency) {
            return Err(GraphError::UnknownAsset {
                asset: dependency.to_string(),
            });
        }
        if dependency.layer > dependent.layer {
            return Err(GraphError::LayerInversion {
                asset: dependent.to_string(),
                upstream: dependency.to_string(),
            });
        }

        self.downstream
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
        self.upstream
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());

        if let Some(cycle) = self.find_cycle_through(dependent) {
            if let Some(set) = self.downstream.get_mut(dependency) {
                set.remove(dependent);
            }
            if let Some(set) = self.upstream.get_mut(dependent) {
                set.remove(dependency);
            }
            return Err(GraphError::Cycle { assets: cycle });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &AssetId) -> GraphResult<&AssetNode> {
        self.nodes.get(id).ok_or_else(|| GraphError::UnknownAsset {
            asset: id.to_string(),
        })
    }

    /// Cron-triggered assets.
    pub fn roots(&self) -> impl Iterator<Item = &AssetNode> {
        self.nodes.values().filter(|n| n.is_root())
    }

    /// Direct dependents of `id`.
    pub fn downstream_of(&self, id: &AssetId) -> GraphResult<Vec<&AssetNode>> {
        self.get(id)?;
        Ok(self
            .downstream
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|d| self.nodes.get(d))
            .collect())
    }

    /// Assets grouped by Kahn wave: every asset appears after all of its
    /// upstreams, and assets in one level are independent of each other.
    pub fn levels(&self) -> GraphResult<Vec<Vec<AssetId>>> {
        let mut in_degree: BTreeMap<&AssetId, usize> = self
            .nodes
            .keys()
            .map(|id| (id, self.upstream.get(id).map_or(0, BTreeSet::len)))
            .collect();

        let mut current: Vec<&AssetId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut levels = Vec::new();
        let mut seen = 0;

        while !current.is_empty() {
            seen += current.len();
            let mut next = BTreeSet::new();
            for id in &current {
                for dep in self.downstream.get(*id).into_iter().flatten() {
                    if let Some(deg) = in_degree.get_mut(dep) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.insert(dep);
                        }
                    }
                }
            }
            levels.push(current.into_iter().cloned().collect());
            current = next.into_iter().collect();
        }

        if seen != self.nodes.len() {
            return Err(GraphError::Cycle {
                assets: self.nodes.keys().map(ToString::to_string).collect(),
            });
        }
        Ok(levels)
    }

    fn find_cycle_through(&self, start: &AssetId) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.dfs_cycle(start, &mut visited, &mut path) {
            Some(path.iter().map(ToString::to_string).collect())
        } else {
            None
        }
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a AssetId,
        visited: &mut HashSet<&'a AssetId>,
        path: &mut Vec<&'a AssetId>,
    ) -> bool {
        if path.contains(&node) {
            path.push(node);
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        path.push(node);
        for dep in self.downstream.get(node).into_iter().flatten() {
            if self.dfs_cycle(dep, visited, path) {
                return true;
            }
        }
        path.pop();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> AssetId {
        s.parse().unwrap()
    }

    fn daily() -> CronSchedule {
        CronSchedule::parse("0 6 * * *").unwrap()
    }

    fn medallion() -> AssetGraph {
        AssetGraph::from_nodes([
            AssetNode::cron(id("bronze/screen_time/raw"), daily(), 1),
            AssetNode::eager(id("silver/screen_time/app_usage"), vec![id("bronze/screen_time/raw")]),
            AssetNode::cron(id("bronze/location/raw"), daily(), 1),
            AssetNode::eager(id("silver/location/visits"), vec![id("bronze/location/raw")]),
            AssetNode::eager(
                id("gold/daily/summary"),
                vec![id("silver/screen_time/app_usage"), id("silver/location/visits")],
            ),
        ])
        .unwrap()
    }

    #[test]
    fn levels_put_upstreams_first() {
        let levels = medallion().levels().unwrap();
        assert_eq!(levels.len(), 3);
        assert!(levels[0].iter().all(|a| a.layer == strata_state::Layer::Bronze));
        assert_eq!(levels[2], vec![id("gold/daily/summary")]);
    }

    #[test]
    fn duplicate_asset_rejected() {
        let err = AssetGraph::from_nodes([
            AssetNode::cron(id("bronze/location/raw"), daily(), 0),
            AssetNode::cron(id("bronze/location/raw"), daily(), 0),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateAsset { .. }));
    }

    #[test]
    fn cycle_rejected() {
        let err = AssetGraph::from_nodes([
            AssetNode::cron(id("bronze/location/raw"), daily(), 0),
            AssetNode::eager(
                id("silver/location/a"),
                vec![id("bronze/location/raw"), id("silver/location/b")],
            ),
            AssetNode::eager(id("silver/location/b"), vec![id("silver/location/a")]),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn trigger_shape_is_checked() {
        let unknown = AssetGraph::from_nodes([AssetNode::eager(
            id("silver/location/visits"),
            vec![id("bronze/location/raw")],
        )])
        .unwrap_err();
        assert!(matches!(unknown, GraphError::UnknownAsset { .. }));

        let orphan =
            AssetGraph::from_nodes([AssetNode::eager(id("silver/location/visits"), vec![])]).unwrap_err();
        assert!(matches!(orphan, GraphError::EagerWithoutUpstream { .. }));

        let inverted = AssetGraph::from_nodes([
            AssetNode::cron(id("gold/location/raw"), daily(), 0),
            AssetNode::eager(id("silver/location/visits"), vec![id("gold/location/raw")]),
        ])
        .unwrap_err();
        assert!(matches!(inverted, GraphError::LayerInversion { .. }));
    }

    #[test]
    fn downstream_lists_direct_dependents_only() {
        let g = medallion();
        let deps: Vec<_> = g
            .downstream_of(&id("bronze/location/raw"))
            .unwrap()
            .into_iter()
            .map(|n| n.id.clone())
            .collect();
        assert_eq!(deps, vec![id("silver/location/visits")]);
        assert!(g.downstream_of(&id("gold/daily/summary")).unwrap().is_empty());
        assert!(g.downstream_of(&id("gold/location/none")).is_err());
        assert_eq!(g.roots().count(), 2);
    }
}
