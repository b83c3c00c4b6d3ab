// Downstream logical-table views
//
// Each loaded logical table is registered in a DataFusion SessionContext as an
// empty MemTable carrying the table's Arrow schema, so the query planner sees
// every logical table with its current shape.

use anyhow::{Context, Result};
use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::prelude::*;
use datafusion::common::TableReference;
use std::sync::Arc;

use crate::models::TableMetadata;

/// Regenerates downstream views after a refresh publishes new table shapes
#[async_trait]
pub trait ViewPublisher: Send + Sync {
    /// Regenerate views for changed tables and drop removed ones.
    /// Failures are reported per table as `(table, reason)`.
    async fn publish(&self, changed: &[Arc<TableMetadata>], removed: &[String]) -> Result<(), Vec<(String, String)>>;
}

/// Configuration for the view session
#[derive(Debug, Clone)]
pub struct ViewSessionConfig {
    pub batch_size: usize,
    pub target_partitions: usize,
}

impl Default for ViewSessionConfig {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            target_partitions: num_cpus::get(),
        }
    }
}

/// Publishes logical tables into a DataFusion session
pub struct DataFusionViewPublisher {
    ctx: SessionContext,
}

impl DataFusionViewPublisher {
    pub fn new(config: ViewSessionConfig) -> Self {
        let session_config = SessionConfig::new()
            .with_batch_size(config.batch_size)
            .with_target_partitions(config.target_partitions);
        Self {
            ctx: SessionContext::new_with_config(session_config),
        }
    }

    pub fn session_context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn is_registered(&self, table: &str) -> bool {
        self.ctx.table_exist(TableReference::bare(table)).unwrap_or(false)
    }

    fn register(&self, metadata: &TableMetadata) -> Result<()> {
        let reference = TableReference::bare(metadata.table.as_str());
        // An empty partition; rows are served by the wrappers, not the view
        let table = MemTable::try_new(metadata.schema.clone(), vec![vec![]])
            .with_context(|| format!("Failed to build view for {}", metadata.table))?;

        self.ctx
            .deregister_table(reference.clone())
            .with_context(|| format!("Failed to drop previous view for {}", metadata.table))?;
        self.ctx
            .register_table(reference, Arc::new(table))
            .with_context(|| format!("Failed to register view for {}", metadata.table))?;
        Ok(())
    }

    fn deregister(&self, table: &str) -> Result<()> {
        self.ctx
            .deregister_table(TableReference::bare(table))
            .with_context(|| format!("Failed to drop view for {}", table))?;
        Ok(())
    }
}

impl Default for DataFusionViewPublisher {
    fn default() -> Self {
        Self::new(ViewSessionConfig::default())
    }
}

#[async_trait]
impl ViewPublisher for DataFusionViewPublisher {
    async fn publish(&self, changed: &[Arc<TableMetadata>], removed: &[String]) -> Result<(), Vec<(String, String)>> {
        let mut failures = Vec::new();

        for table in removed {
            if let Err(e) = self.deregister(table) {
                tracing::warn!("{:#}", e);
                failures.push((table.clone(), format!("{:#}", e)));
            }
        }

        for metadata in changed {
            match self.register(metadata) {
                Ok(()) => tracing::debug!("Regenerated view for logical table {}", metadata.table),
                Err(e) => {
                    tracing::warn!("{:#}", e);
                    failures.push((metadata.table.clone(), format!("{:#}", e)));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogicalTableDef;
    use crate::validation::ColumnDefParser;

    fn metadata(table: &str, columns: &str) -> Arc<TableMetadata> {
        let def = LogicalTableDef {
            columns: columns.to_string(),
            ..Default::default()
        };
        Arc::new(ColumnDefParser::build_metadata(table, &def).unwrap())
    }

    #[tokio::test]
    async fn test_publish_and_remove_views() {
        let views = DataFusionViewPublisher::default();
        views.publish(&[metadata("Orders", "id INT")], &[]).await.unwrap();
        assert!(views.is_registered("Orders"));

        let df = views.session_context().table(TableReference::bare("Orders")).await.unwrap();
        assert_eq!(df.schema().fields().len(), 3);

        // republishing replaces the previous shape
        views
            .publish(&[metadata("Orders", "id INT, name VARCHAR(10)")], &[])
            .await
            .unwrap();
        let df = views.session_context().table(TableReference::bare("Orders")).await.unwrap();
        assert_eq!(df.schema().fields().len(), 4);

        views.publish(&[], &["Orders".to_string()]).await.unwrap();
        assert!(!views.is_registered("Orders"));
    }
}
