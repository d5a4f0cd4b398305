//! JSON graph files.
//!
//! ```json
//! {
//!   "name": "web",
//!   "resources": [
//!     {"kind": "noop", "name": "pkg"},
//!     {"kind": "timer", "name": "tick", "params": {"interval": 30}, "meta": {"retry": 2}}
//!   ],
//!   "edges": [{"from": "noop[pkg]", "to": "timer[tick]"}]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use steward_graph::VertexId;
use steward_types::{Result, StewardError};

use crate::registry::{ResourceDecl, ResourceRegistry};
use crate::resource::{Edge, ResourceGraph};

fn default_graph_name() -> String {
    "graph".to_string()
}

/// An edge between two resources, each written as `kind[name]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDecl {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphFile {
    #[serde(default = "default_graph_name")]
    pub name: String,
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    #[serde(default)]
    pub edges: Vec<EdgeDecl>,
}

impl GraphFile {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Instantiate every resource through `registry` and wire up the edges.
    pub fn build(&self, registry: &ResourceRegistry) -> Result<ResourceGraph> {
        let mut graph = ResourceGraph::new(self.name.clone());
        let mut ids: HashMap<String, VertexId> = HashMap::new();

        for decl in &self.resources {
            let res = registry.build(decl)?;
            let hidden = res.meta_params().hidden;
            let key = res.to_string();
            let id = graph.add_vertex(res);
            // hidden resources may share a name with anything but can't be edge endpoints
            if hidden {
                continue;
            }
            if ids.insert(key.clone(), id).is_some() {
                return Err(StewardError::DuplicateResource(key));
            }
        }

        for edge in &self.edges {
            let lookup = |key: &str| {
                ids.get(key)
                    .copied()
                    .ok_or_else(|| StewardError::UnknownEdgeEndpoint(key.to_string()))
            };
            let from = lookup(&edge.from)?;
            let to = lookup(&edge.to)?;
            graph.add_edge(
                from,
                to,
                Edge {
                    name: format!("{} -> {}", edge.from, edge.to),
                    notify: edge.notify,
                },
            )?;
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_registry;

    const WEB: &str = r#"{
        "name": "web",
        "resources": [
            {"kind": "noop", "name": "pkg"},
            {"kind": "timer", "name": "tick", "params": {"interval": 30}, "meta": {"retry": 2}}
        ],
        "edges": [{"from": "noop[pkg]", "to": "timer[tick]", "notify": true}]
    }"#;

    #[test]
    fn builds_graph_with_edges() {
        let file = GraphFile::from_json(WEB).unwrap();
        let graph = file.build(&default_registry()).unwrap();

        assert_eq!(graph.name(), "web");
        assert_eq!(graph.num_vertices(), 2);
        let (from, to, edge) = graph.edges().next().unwrap();
        assert_eq!(graph.vertex(from).unwrap().to_string(), "noop[pkg]");
        assert_eq!(graph.vertex(to).unwrap().to_string(), "timer[tick]");
        assert!(edge.notify);
        assert_eq!(edge.name, "noop[pkg] -> timer[tick]");

        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec![from, to]);
    }

    #[test]
    fn empty_file_is_empty_graph() {
        let file = GraphFile::from_json("{}").unwrap();
        assert_eq!(file.name, "graph");
        assert!(file.build(&default_registry()).unwrap().is_empty());
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let file = GraphFile::from_json(
            r#"{"resources": [{"kind": "noop", "name": "a"}],
                "edges": [{"from": "noop[a]", "to": "noop[b]"}]}"#,
        )
        .unwrap();
        let err = file.build(&default_registry()).unwrap_err();
        assert!(matches!(err, StewardError::UnknownEdgeEndpoint(ref k) if k == "noop[b]"));
    }

    #[test]
    fn duplicate_resource_is_rejected() {
        let file = GraphFile::from_json(
            r#"{"resources": [{"kind": "noop", "name": "a"}, {"kind": "noop", "name": "a"}]}"#,
        )
        .unwrap();
        let err = file.build(&default_registry()).unwrap_err();
        assert!(matches!(err, StewardError::DuplicateResource(_)));
    }

    #[test]
    fn hidden_twin_is_accepted_in_either_order() {
        let visible = r#"{"kind": "noop", "name": "a"}"#;
        let hidden = r#"{"kind": "noop", "name": "a", "meta": {"hidden": true}}"#;
        for (first, second) in [(visible, hidden), (hidden, visible)] {
            let raw = format!(
                r#"{{"resources": [{first}, {second}, {{"kind": "noop", "name": "b"}}],
                    "edges": [{{"from": "noop[a]", "to": "noop[b]"}}]}}"#
            );
            let graph = GraphFile::from_json(&raw)
                .unwrap()
                .build(&default_registry())
                .unwrap();
            assert_eq!(graph.num_vertices(), 3);

            // the edge always lands on the visible resource
            let (from, _, _) = graph.edges().next().unwrap();
            assert!(!graph.vertex(from).unwrap().meta_params().hidden);
        }
    }

    #[test]
    fn hidden_resource_is_not_an_edge_endpoint() {
        let file = GraphFile::from_json(
            r#"{"resources": [{"kind": "noop", "name": "h", "meta": {"hidden": true}},
                              {"kind": "noop", "name": "b"}],
                "edges": [{"from": "noop[h]", "to": "noop[b]"}]}"#,
        )
        .unwrap();
        let err = file.build(&default_registry()).unwrap_err();
        assert!(matches!(err, StewardError::UnknownEdgeEndpoint(ref k) if k == "noop[h]"));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, WEB).unwrap();
        let file = GraphFile::load(&path).unwrap();
        assert_eq!(file.resources.len(), 2);
        assert_eq!(file.resources[1].meta.retry, 2);
    }
}
