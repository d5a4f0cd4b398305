use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use steward_types::{Result, StewardError};

static NEXT_VERTEX_ID: AtomicU64 = AtomicU64::new(1);

/// Object identity of a vertex. Allocated once per `add_vertex` call and
/// never reused, so ids from different graphs never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(u64);

impl VertexId {
    fn next() -> Self {
        VertexId(NEXT_VERTEX_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A vertex handle: its identity plus a shared reference to the value.
pub struct Node<V: ?Sized> {
    pub id: VertexId,
    pub value: Arc<V>,
}

impl<V: ?Sized> Clone for Node<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
        }
    }
}

impl<V: ?Sized + fmt::Debug> fmt::Debug for Node<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}

/// Directed graph of shared vertices.
///
/// Iteration order is insertion order, which keeps topological sorts and
/// sync plans deterministic.
pub struct Graph<V: ?Sized, E> {
    name: String,
    vertices: BTreeMap<VertexId, Arc<V>>,
    /// from -> (to -> edge)
    adjacency: BTreeMap<VertexId, BTreeMap<VertexId, E>>,
}

impl<V: ?Sized, E: Clone> Clone for Graph<V, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            vertices: self.vertices.clone(),
            adjacency: self.adjacency.clone(),
        }
    }
}

impl<V: ?Sized, E> fmt::Debug for Graph<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("vertices", &self.vertices.len())
            .field("edges", &self.num_edges())
            .finish()
    }
}

impl<V: ?Sized, E> Graph<V, E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vertices: BTreeMap::new(),
            adjacency: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a value and return its freshly allocated identity.
    pub fn add_vertex(&mut self, value: Arc<V>) -> VertexId {
        let id = VertexId::next();
        self.vertices.insert(id, value);
        id
    }

    /// Add (or replace) the edge `from -> to`.
    pub fn add_edge(&mut self, from: VertexId, to: VertexId, edge: E) -> Result<()> {
        for id in [from, to] {
            if !self.vertices.contains_key(&id) {
                return Err(StewardError::MissingVertex(id.as_u64()));
            }
        }
        self.adjacency.entry(from).or_default().insert(to, edge);
        Ok(())
    }

    /// Remove a vertex and every edge touching it.
    pub fn remove_vertex(&mut self, id: VertexId) -> Option<Arc<V>> {
        let value = self.vertices.remove(&id)?;
        self.adjacency.remove(&id);
        for targets in self.adjacency.values_mut() {
            targets.remove(&id);
        }
        self.adjacency.retain(|_, targets| !targets.is_empty());
        Some(value)
    }

    pub fn vertex(&self, id: VertexId) -> Option<&Arc<V>> {
        self.vertices.get(&id)
    }

    pub fn node(&self, id: VertexId) -> Option<Node<V>> {
        self.vertices.get(&id).map(|value| Node {
            id,
            value: Arc::clone(value),
        })
    }

    pub fn has_vertex(&self, id: VertexId) -> bool {
        self.vertices.contains_key(&id)
    }

    pub fn vertices(&self) -> impl Iterator<Item = (VertexId, &Arc<V>)> {
        self.vertices.iter().map(|(id, v)| (*id, v))
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.vertices.keys().copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = (VertexId, VertexId, &E)> {
        self.adjacency
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |(to, e)| (*from, *to, e)))
    }

    pub fn edge(&self, from: VertexId, to: VertexId) -> Option<&E> {
        self.adjacency.get(&from).and_then(|targets| targets.get(&to))
    }

    /// Vertices this one points at.
    pub fn outgoing(&self, id: VertexId) -> Vec<VertexId> {
        self.adjacency
            .get(&id)
            .map(|targets| targets.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Vertices pointing at this one.
    pub fn incoming(&self, id: VertexId) -> Vec<VertexId> {
        self.adjacency
            .iter()
            .filter(|(_, targets)| targets.contains_key(&id))
            .map(|(from, _)| *from)
            .collect()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_edges(&self) -> usize {
        self.adjacency.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Kahn's algorithm. Parents always come before their children; ties
    /// are broken by insertion order.
    pub fn topological_sort(&self) -> Result<Vec<VertexId>> {
        let mut indegree: BTreeMap<VertexId, usize> =
            self.vertices.keys().map(|id| (*id, 0)).collect();
        for (_, to, _) in self.edges() {
            if let Some(count) = indegree.get_mut(&to) {
                *count += 1;
            }
        }

        let mut queue: VecDeque<VertexId> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.vertices.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for child in self.outgoing(id) {
                if let Some(count) = indegree.get_mut(&child) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if order.len() != self.vertices.len() {
            return Err(StewardError::GraphCycle {
                graph: self.name.clone(),
            });
        }
        Ok(order)
    }

    /// Replace the contents of this graph, keeping its name.
    pub(crate) fn replace(
        &mut self,
        vertices: BTreeMap<VertexId, Arc<V>>,
        adjacency: BTreeMap<VertexId, BTreeMap<VertexId, E>>,
    ) {
        self.vertices = vertices;
        self.adjacency = adjacency;
    }
}

/// Reverse a vertex ordering, typically the output of `topological_sort`.
pub fn reverse(order: &[VertexId]) -> Vec<VertexId> {
    order.iter().rev().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> (Graph<str, ()>, Vec<VertexId>) {
        let mut g = Graph::new("test");
        let ids: Vec<_> = names.iter().map(|n| g.add_vertex(Arc::from(*n))).collect();
        for pair in ids.windows(2) {
            g.add_edge(pair[0], pair[1], ()).unwrap();
        }
        (g, ids)
    }

    #[test]
    fn vertex_ids_are_unique_across_graphs() {
        let mut a: Graph<str, ()> = Graph::new("a");
        let mut b: Graph<str, ()> = Graph::new("b");
        let x = a.add_vertex(Arc::from("x"));
        let y = b.add_vertex(Arc::from("x"));
        assert_ne!(x, y);
    }

    #[test]
    fn add_edge_requires_both_endpoints() {
        let mut g: Graph<str, ()> = Graph::new("g");
        let a = g.add_vertex(Arc::from("a"));
        let mut other: Graph<str, ()> = Graph::new("other");
        let stray = other.add_vertex(Arc::from("stray"));

        let err = g.add_edge(a, stray, ()).unwrap_err();
        assert!(matches!(err, StewardError::MissingVertex(id) if id == stray.as_u64()));
    }

    #[test]
    fn topological_sort_orders_parents_first() {
        let (g, ids) = chain(&["a", "b", "c"]);
        assert_eq!(g.topological_sort().unwrap(), ids);
    }

    #[test]
    fn topological_sort_diamond() {
        let mut g: Graph<str, ()> = Graph::new("diamond");
        let a = g.add_vertex(Arc::from("a"));
        let b = g.add_vertex(Arc::from("b"));
        let c = g.add_vertex(Arc::from("c"));
        let d = g.add_vertex(Arc::from("d"));
        g.add_edge(a, b, ()).unwrap();
        g.add_edge(a, c, ()).unwrap();
        g.add_edge(b, d, ()).unwrap();
        g.add_edge(c, d, ()).unwrap();

        let order = g.topological_sort().unwrap();
        let pos = |id| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(a) < pos(c));
        assert!(pos(b) < pos(d));
        assert!(pos(c) < pos(d));
    }

    #[test]
    fn topological_sort_detects_cycle() {
        let (mut g, ids) = chain(&["a", "b", "c"]);
        g.add_edge(ids[2], ids[0], ()).unwrap();
        assert!(matches!(
            g.topological_sort(),
            Err(StewardError::GraphCycle { ref graph }) if graph == "test"
        ));
    }

    #[test]
    fn reverse_flips_order() {
        let (g, ids) = chain(&["a", "b", "c"]);
        let order = g.topological_sort().unwrap();
        assert_eq!(reverse(&order), vec![ids[2], ids[1], ids[0]]);
    }

    #[test]
    fn remove_vertex_drops_edges() {
        let (mut g, ids) = chain(&["a", "b", "c"]);
        assert_eq!(g.num_edges(), 2);
        g.remove_vertex(ids[1]).unwrap();
        assert_eq!(g.num_vertices(), 2);
        assert_eq!(g.num_edges(), 0);
        assert!(g.outgoing(ids[0]).is_empty());
        assert!(g.incoming(ids[2]).is_empty());
    }

    #[test]
    fn incoming_and_outgoing() {
        let (g, ids) = chain(&["a", "b", "c"]);
        assert_eq!(g.outgoing(ids[0]), vec![ids[1]]);
        assert_eq!(g.incoming(ids[2]), vec![ids[1]]);
        assert!(g.incoming(ids[0]).is_empty());
    }

    #[test]
    fn clone_shares_vertex_identity() {
        let (g, ids) = chain(&["a", "b"]);
        let copy = g.clone();
        assert_eq!(copy.vertex_ids().collect::<Vec<_>>(), ids);
        assert!(Arc::ptr_eq(g.vertex(ids[0]).unwrap(), copy.vertex(ids[0]).unwrap()));
    }
}
