use datafusion::arrow::datatypes::SchemaRef;
use serde::{Deserialize, Serialize};

/// Hidden column carrying the id of the node that produced a row
pub const NODE_ID_COLUMN: &str = "GDB_NODE";
/// Hidden column carrying the name of the leaf data source that produced a row
pub const LEAF_COLUMN: &str = "GDB_LEAF";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
}

/// Column whose value is fixed for every row of the logical table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Physical,
    Constant,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedColumn {
    pub name: String,
    pub data_type: String,
    pub kind: ColumnKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Resolved schema of a logical table, shared by every wrapper of that table
#[derive(Debug, Clone)]
pub struct TableMetadata {
    pub table: String,
    pub columns: Vec<ResolvedColumn>,
    pub schema: SchemaRef,
    /// Definition text the metadata was built from
    pub definition: String,
}

impl TableMetadata {
    pub fn physical_columns(&self) -> impl Iterator<Item = &ResolvedColumn> {
        self.columns.iter().filter(|c| c.kind == ColumnKind::Physical)
    }

    pub fn column(&self, name: &str) -> Option<&ResolvedColumn> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_physical_column(&self, name: &str) -> bool {
        self.physical_columns().any(|c| c.name.eq_ignore_ascii_case(name))
    }
}
