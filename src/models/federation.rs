use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::descriptor::EndpointDescriptor;
use super::table::ConstantColumn;

/// Desired state of the node, re-read from the config source on every refresh
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederationDefinitions {
    #[serde(default)]
    pub tables: BTreeMap<String, LogicalTableDef>,
    #[serde(default)]
    pub peers: Vec<PeerConnection>,
}

/// Definition of one logical table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicalTableDef {
    /// Column definition text, e.g. `id INT, name VARCHAR(20)`
    pub columns: String,
    #[serde(default)]
    pub constants: Vec<ConstantColumn>,
    #[serde(default)]
    pub sources: Vec<SourceDef>,
}

impl LogicalTableDef {
    /// Signature of everything that shapes the published view
    pub fn view_signature(&self) -> String {
        let mut sig = self.columns.trim().to_string();
        for c in &self.constants {
            sig.push_str(&format!(";{} {}={}", c.name, c.data_type, c.value));
        }
        sig
    }

    pub fn source(&self, name: &str) -> Option<&SourceDef> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// One local physical source behind a logical table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDef {
    /// Local id, unique within the table
    pub name: String,
    pub endpoint: EndpointDescriptor,
    /// Physical table or sub-query on the endpoint; defaults to the logical table name
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub options: SourceOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceOptions {
    /// Serve rows from an in-memory cached copy
    #[serde(default)]
    pub in_memory: bool,
    /// Explicit mapping of physical columns, by logical column name
    #[serde(default)]
    pub columns: Vec<String>,
    /// Expiry of the in-memory row cache
    #[serde(default)]
    pub cache_expiry_secs: Option<u64>,
    /// The source targets another federation node
    #[serde(default)]
    pub peer: bool,
}

/// A peer-node connection contributing a wrapper to every logical table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnection {
    /// Connection id, used to name peer wrappers `<table>_<id>`
    pub id: String,
    /// Node id the peer announces; defaults to the connection id
    #[serde(default)]
    pub node_id: Option<String>,
    pub endpoint: EndpointDescriptor,
    /// Learned at runtime rather than defined in config
    #[serde(default)]
    pub discovered: bool,
}

impl PeerConnection {
    pub fn node_id(&self) -> &str {
        self.node_id.as_deref().unwrap_or(&self.id)
    }
}

/// Name of the wrapper for a local source or peer connection within a table
pub fn wrapper_name(table: &str, local_or_peer_id: &str) -> String {
    format!("{}_{}", table, local_or_peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_name() {
        assert_eq!(wrapper_name("orders", "eu"), "orders_eu");
    }

    #[test]
    fn test_view_signature_tracks_constants() {
        let mut def = LogicalTableDef {
            columns: " id INT ".to_string(),
            ..Default::default()
        };
        assert_eq!(def.view_signature(), "id INT");

        def.constants.push(ConstantColumn {
            name: "region".to_string(),
            data_type: "VARCHAR(8)".to_string(),
            value: "eu".to_string(),
        });
        assert_eq!(def.view_signature(), "id INT;region VARCHAR(8)=eu");
    }

    #[test]
    fn test_peer_node_id_defaults_to_connection_id() {
        let peer = PeerConnection {
            id: "n2".to_string(),
            node_id: None,
            endpoint: EndpointDescriptor::relational("http://n2:3000", None, None),
            discovered: false,
        };
        assert_eq!(peer.node_id(), "n2");
    }
}
