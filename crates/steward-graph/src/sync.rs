//! Graph sync: transform one graph into another through caller callbacks.
//!
//! [`Graph::sync`] matches candidate vertices against the current ones with
//! [`SyncHandler::vertex_eq`]. Matched vertices are kept as-is (the current
//! instance survives), unmatched current vertices are removed and unmatched
//! candidate vertices are added. All removals run before any addition, so a
//! vertex being reloaded is always torn down before its replacement is set
//! up. The receiver is only mutated once every callback has succeeded.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use steward_types::{Result, StewardError};

use crate::graph::{Graph, Node, VertexId};

/// Callbacks driven by [`Graph::sync`].
#[async_trait]
pub trait SyncHandler<V: ?Sized + Send + Sync + 'static, E: Send + Sync + 'static>: Send {
    /// Whether `candidate` can stand in for `current` without a restart.
    fn vertex_eq(&self, current: &Node<V>, candidate: &Node<V>) -> Result<bool>;

    /// Whether the current edge value can be kept for the candidate edge.
    fn edge_eq(&self, current: &E, candidate: &E) -> Result<bool>;

    /// Called for every current vertex that is going away.
    async fn on_remove(&mut self, node: Node<V>) -> Result<()>;

    /// Called for every candidate vertex that is new.
    async fn on_add(&mut self, node: Node<V>) -> Result<()>;
}

/// The vertex-level outcome of matching two graphs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Candidate id -> current id, for vertices that stay.
    pub kept: BTreeMap<VertexId, VertexId>,
    /// Candidate ids with no current counterpart.
    pub added: Vec<VertexId>,
    /// Current ids with no candidate counterpart.
    pub removed: Vec<VertexId>,
}

/// Counts reported after a successful sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub added: usize,
    pub removed: usize,
    pub kept: usize,
}

impl<V: ?Sized, E> Graph<V, E> {
    /// Match `candidate` against this graph without touching either.
    ///
    /// Each candidate vertex is paired with the first unmatched current
    /// vertex that `vertex_eq` accepts, trying the same identity first.
    pub fn diff<F>(&self, candidate: &Graph<V, E>, mut vertex_eq: F) -> Result<SyncPlan>
    where
        F: FnMut(&Node<V>, &Node<V>) -> Result<bool>,
    {
        let mut plan = SyncPlan::default();
        let mut matched: BTreeSet<VertexId> = BTreeSet::new();

        for cand_id in candidate.vertex_ids() {
            let cand = candidate
                .node(cand_id)
                .ok_or(StewardError::MissingVertex(cand_id.as_u64()))?;

            let mut found = None;
            if let Some(same) = self.node(cand_id).filter(|_| !matched.contains(&cand_id)) {
                if vertex_eq(&same, &cand)? {
                    found = Some(cand_id);
                }
            }
            if found.is_none() {
                for cur_id in self.vertex_ids() {
                    if cur_id == cand_id || matched.contains(&cur_id) {
                        continue;
                    }
                    let cur = self
                        .node(cur_id)
                        .ok_or(StewardError::MissingVertex(cur_id.as_u64()))?;
                    if vertex_eq(&cur, &cand)? {
                        found = Some(cur_id);
                        break;
                    }
                }
            }

            match found {
                Some(cur_id) => {
                    matched.insert(cur_id);
                    plan.kept.insert(cand_id, cur_id);
                }
                None => plan.added.push(cand_id),
            }
        }

        plan.removed = self
            .vertex_ids()
            .filter(|id| !matched.contains(id))
            .collect();
        Ok(plan)
    }
}

impl<V, E> Graph<V, E>
where
    V: ?Sized + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Turn this graph into `candidate`, invoking `handler` for every
    /// vertex that has to go or come. On error the receiver is unchanged.
    pub async fn sync<H>(&mut self, candidate: &Graph<V, E>, handler: &mut H) -> Result<SyncSummary>
    where
        H: SyncHandler<V, E> + ?Sized,
    {
        let plan = self.diff(candidate, |cur, cand| handler.vertex_eq(cur, cand))?;

        // Edges are rebuilt from the candidate, expressed in terms of the
        // surviving vertex ids. Computed before any callback runs.
        let mut adjacency: BTreeMap<VertexId, BTreeMap<VertexId, E>> = BTreeMap::new();
        for (from, to, edge) in candidate.edges() {
            let from = plan.kept.get(&from).copied().unwrap_or(from);
            let to = plan.kept.get(&to).copied().unwrap_or(to);
            let value = match self.edge(from, to) {
                Some(current) => {
                    if handler.edge_eq(current, edge)? {
                        current.clone()
                    } else {
                        edge.clone()
                    }
                }
                None => edge.clone(),
            };
            adjacency.entry(from).or_default().insert(to, value);
        }

        for id in &plan.removed {
            let node = self
                .node(*id)
                .ok_or(StewardError::MissingVertex(id.as_u64()))?;
            tracing::trace!(vertex = %id, "sync: remove");
            handler.on_remove(node).await?;
        }
        for id in &plan.added {
            let node = candidate
                .node(*id)
                .ok_or(StewardError::MissingVertex(id.as_u64()))?;
            tracing::trace!(vertex = %id, "sync: add");
            handler.on_add(node).await?;
        }

        let mut vertices = BTreeMap::new();
        for current in plan.kept.values() {
            if let Some(node) = self.node(*current) {
                vertices.insert(node.id, node.value);
            }
        }
        for id in &plan.added {
            if let Some(node) = candidate.node(*id) {
                vertices.insert(node.id, node.value);
            }
        }
        self.replace(vertices, adjacency);

        Ok(SyncSummary {
            added: plan.added.len(),
            removed: plan.removed.len(),
            kept: plan.kept.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Compares vertices by string value and records callback order.
    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
        reload: HashSet<String>,
        fail_add: Option<String>,
    }

    #[async_trait]
    impl SyncHandler<str, u32> for Recorder {
        fn vertex_eq(&self, current: &Node<str>, candidate: &Node<str>) -> Result<bool> {
            if self.reload.contains(&*current.value) {
                return Ok(false);
            }
            Ok(current.value == candidate.value)
        }

        fn edge_eq(&self, current: &u32, candidate: &u32) -> Result<bool> {
            Ok(current == candidate)
        }

        async fn on_remove(&mut self, node: Node<str>) -> Result<()> {
            self.log.push(format!("-{}", node.value));
            Ok(())
        }

        async fn on_add(&mut self, node: Node<str>) -> Result<()> {
            if self.fail_add.as_deref() == Some(&*node.value) {
                return Err(StewardError::Other(format!("cannot add {}", node.value)));
            }
            self.log.push(format!("+{}", node.value));
            Ok(())
        }
    }

    fn build(names: &[&str], edges: &[(usize, usize, u32)]) -> (Graph<str, u32>, Vec<VertexId>) {
        let mut g = Graph::new("g");
        let ids: Vec<_> = names.iter().map(|n| g.add_vertex(Arc::from(*n))).collect();
        for (from, to, w) in edges {
            g.add_edge(ids[*from], ids[*to], *w).unwrap();
        }
        (g, ids)
    }

    fn values(g: &Graph<str, u32>) -> Vec<String> {
        let mut v: Vec<String> = g.vertices().map(|(_, s)| s.to_string()).collect();
        v.sort();
        v
    }

    #[test]
    fn diff_matches_equal_vertices() {
        let (current, cur_ids) = build(&["a", "b"], &[]);
        let (candidate, cand_ids) = build(&["b", "c"], &[]);
        let plan = current
            .diff(&candidate, |x, y| Ok(x.value == y.value))
            .unwrap();

        assert_eq!(plan.kept.get(&cand_ids[0]), Some(&cur_ids[1]));
        assert_eq!(plan.added, vec![cand_ids[1]]);
        assert_eq!(plan.removed, vec![cur_ids[0]]);
    }

    #[tokio::test]
    async fn sync_keeps_current_instances() {
        let (mut current, cur_ids) = build(&["a", "b"], &[(0, 1, 1)]);
        let (candidate, _) = build(&["a", "b"], &[(0, 1, 1)]);
        let mut rec = Recorder::default();

        let summary = current.sync(&candidate, &mut rec).await.unwrap();

        assert_eq!(summary, SyncSummary { added: 0, removed: 0, kept: 2 });
        assert!(rec.log.is_empty());
        assert_eq!(current.vertex_ids().collect::<Vec<_>>(), cur_ids);
        assert_eq!(current.edge(cur_ids[0], cur_ids[1]), Some(&1));
    }

    #[tokio::test]
    async fn sync_runs_removals_before_additions() {
        let (mut current, _) = build(&["a", "b"], &[]);
        let (candidate, _) = build(&["b", "c", "d"], &[]);
        let mut rec = Recorder::default();

        current.sync(&candidate, &mut rec).await.unwrap();

        assert_eq!(rec.log, vec!["-a", "+c", "+d"]);
        assert_eq!(values(&current), vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn sync_reload_removes_then_adds_same_value() {
        let (mut current, cur_ids) = build(&["a"], &[]);
        let (candidate, cand_ids) = build(&["a"], &[]);
        let mut rec = Recorder::default();
        rec.reload.insert("a".into());

        current.sync(&candidate, &mut rec).await.unwrap();

        assert_eq!(rec.log, vec!["-a", "+a"]);
        assert!(!current.has_vertex(cur_ids[0]));
        assert!(current.has_vertex(cand_ids[0]));
    }

    #[tokio::test]
    async fn sync_failure_leaves_graph_untouched() {
        let (mut current, cur_ids) = build(&["a", "b"], &[(0, 1, 7)]);
        let (candidate, _) = build(&["b", "c"], &[]);
        let mut rec = Recorder {
            fail_add: Some("c".into()),
            ..Recorder::default()
        };

        let err = current.sync(&candidate, &mut rec).await.unwrap_err();

        assert!(err.to_string().contains("cannot add c"));
        assert_eq!(current.vertex_ids().collect::<Vec<_>>(), cur_ids);
        assert_eq!(current.edge(cur_ids[0], cur_ids[1]), Some(&7));
    }

    #[tokio::test]
    async fn sync_rebuilds_edges_from_candidate() {
        let (mut current, cur_ids) = build(&["a", "b", "c"], &[(0, 1, 1), (1, 2, 1)]);
        let (candidate, _) = build(&["a", "b", "c"], &[(0, 1, 2), (0, 2, 1)]);
        let mut rec = Recorder::default();

        current.sync(&candidate, &mut rec).await.unwrap();

        assert_eq!(current.num_edges(), 2);
        assert_eq!(current.edge(cur_ids[0], cur_ids[1]), Some(&2));
        assert_eq!(current.edge(cur_ids[0], cur_ids[2]), Some(&1));
        assert_eq!(current.edge(cur_ids[1], cur_ids[2]), None);
    }

    #[tokio::test]
    async fn sync_to_empty_removes_everything() {
        let (mut current, _) = build(&["a", "b"], &[(0, 1, 1)]);
        let empty: Graph<str, u32> = Graph::new("empty");
        let mut rec = Recorder::default();

        let summary = current.sync(&empty, &mut rec).await.unwrap();

        assert_eq!(summary.removed, 2);
        assert!(current.is_empty());
        assert_eq!(current.num_edges(), 0);
        assert_eq!(current.name(), "g");
    }
}
