use datafusion::arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::FederationError;
use crate::models::{
    ColumnDef, ColumnKind, LogicalTableDef, ResolvedColumn, TableMetadata, LEAF_COLUMN, NODE_ID_COLUMN,
};

/// Hidden provenance columns appended to every logical table
pub const HIDDEN_COLUMNS: [(&str, &str); 2] = [(NODE_ID_COLUMN, "VARCHAR(20)"), (LEAF_COLUMN, "VARCHAR(50)")];

/// Parses logical table column definitions and resolves them into table metadata
pub struct ColumnDefParser;

impl ColumnDefParser {
    /// Parse column definition text such as `id INT, name VARCHAR(20)`
    pub fn parse_columns(definition: &str) -> Result<Vec<ColumnDef>, FederationError> {
        let definition = definition.trim();
        if definition.is_empty() {
            return Err(FederationError::IncompatibleMetadata(
                "Column definition cannot be empty".to_string(),
            ));
        }

        // Wrap in a CREATE TABLE so the parser sees a complete statement
        let sql = format!("CREATE TABLE t ({})", definition);
        let dialect = GenericDialect {};
        let ast = Parser::parse_sql(&dialect, &sql).map_err(|e| {
            FederationError::IncompatibleMetadata(format!("Invalid column definition '{}': {}", definition, e))
        })?;

        let columns = match ast.into_iter().next() {
            Some(Statement::CreateTable(create)) => create.columns,
            _ => {
                return Err(FederationError::IncompatibleMetadata(format!(
                    "Invalid column definition '{}'",
                    definition
                )))
            }
        };

        Ok(columns
            .into_iter()
            .map(|c| ColumnDef {
                name: c.name.value,
                data_type: c.data_type.to_string().to_uppercase(),
            })
            .collect())
    }

    /// Resolve a table definition into metadata: physical columns, constants, then hidden columns
    pub fn build_metadata(table: &str, def: &LogicalTableDef) -> Result<TableMetadata, FederationError> {
        let mut columns: Vec<ResolvedColumn> = Self::parse_columns(&def.columns)?
            .into_iter()
            .map(|c| ResolvedColumn {
                name: c.name,
                data_type: c.data_type,
                kind: ColumnKind::Physical,
                value: None,
            })
            .collect();

        for constant in &def.constants {
            let parsed = Self::parse_columns(&format!("{} {}", constant.name, constant.data_type))?;
            let data_type = parsed
                .into_iter()
                .next()
                .map(|c| c.data_type)
                .unwrap_or_else(|| constant.data_type.to_uppercase());
            columns.push(ResolvedColumn {
                name: constant.name.clone(),
                data_type,
                kind: ColumnKind::Constant,
                value: Some(constant.value.clone()),
            });
        }

        for (name, data_type) in HIDDEN_COLUMNS {
            columns.push(ResolvedColumn {
                name: name.to_string(),
                data_type: data_type.to_string(),
                kind: ColumnKind::Hidden,
                value: None,
            });
        }

        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.name.to_uppercase()) {
                return Err(FederationError::IncompatibleMetadata(format!(
                    "Duplicate column '{}' in logical table {}",
                    c.name, table
                )));
            }
        }

        let fields: Vec<Field> = columns
            .iter()
            .map(|c| Field::new(&c.name, Self::sql_type_to_arrow(&c.data_type), true))
            .collect();

        Ok(TableMetadata {
            table: table.to_string(),
            columns,
            schema: Arc::new(Schema::new(fields)),
            definition: def.view_signature(),
        })
    }

    /// Map SQL type text to an Arrow DataType
    pub fn sql_type_to_arrow(data_type: &str) -> DataType {
        let upper = data_type.trim().to_uppercase();
        let base = upper.split(['(', ' ']).next().unwrap_or("");
        match base {
            "BOOLEAN" | "BOOL" => DataType::Boolean,
            "TINYINT" | "SMALLINT" | "INT2" => DataType::Int16,
            "INT" | "INTEGER" | "INT4" => DataType::Int32,
            "BIGINT" | "INT8" => DataType::Int64,
            "REAL" | "FLOAT4" => DataType::Float32,
            "FLOAT" | "DOUBLE" | "FLOAT8" | "DECIMAL" | "NUMERIC" => DataType::Float64,
            "DATE" => DataType::Date32,
            "TIMESTAMP" | "DATETIME" => DataType::Timestamp(TimeUnit::Microsecond, None),
            _ => DataType::Utf8, // Default to string for everything else
        }
    }
}
