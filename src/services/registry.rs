use dashmap::DashMap;
use std::sync::Arc;

use crate::models::{TableMetadata, TableStatus};
use crate::services::wrapper::DataSourceWrapper;

/// Published, immutable wrapper array for one logical table
pub type DataSourceArray = Arc<[Arc<DataSourceWrapper>]>;

/// Logical table name to ordered wrapper array, published copy-on-write.
///
/// Readers take a snapshot of the array and never observe a half-built one. All
/// mutation happens under the reload coordinator's scope.
#[derive(Default)]
pub struct LogicalTableRegistry {
    arrays: DashMap<String, DataSourceArray>,
    metadata: DashMap<String, Arc<TableMetadata>>,
    wrappers: DashMap<String, Arc<DataSourceWrapper>>,
}

impl LogicalTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the wrapper array for a table
    pub fn get_data_sources(&self, table: &str) -> Option<DataSourceArray> {
        self.arrays.get(table).map(|entry| entry.value().clone())
    }

    pub fn is_logical_table_loaded(&self, table: &str) -> bool {
        self.arrays.contains_key(table)
    }

    pub fn loaded_table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.arrays.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn metadata(&self, table: &str) -> Option<Arc<TableMetadata>> {
        self.metadata.get(table).map(|entry| entry.value().clone())
    }

    pub fn wrapper(&self, name: &str) -> Option<Arc<DataSourceWrapper>> {
        self.wrappers.get(name).map(|entry| entry.value().clone())
    }

    pub fn wrapper_count(&self) -> usize {
        self.wrappers.len()
    }

    pub fn table_status(&self, table: &str) -> Option<TableStatus> {
        let array = self.get_data_sources(table)?;
        Some(TableStatus {
            name: table.to_string(),
            columns: self.metadata(table).map(|m| m.columns.clone()).unwrap_or_default(),
            sources: array.iter().map(|w| w.name().to_string()).collect(),
        })
    }

    pub(crate) fn publish(&self, table: &str, array: Vec<Arc<DataSourceWrapper>>) {
        self.arrays.insert(table.to_string(), array.into());
    }

    pub(crate) fn set_metadata(&self, table: &str, metadata: Arc<TableMetadata>) {
        self.metadata.insert(table.to_string(), metadata);
    }

    /// Unpublish a table and its metadata, returning the last published array
    pub(crate) fn remove_table(&self, table: &str) -> Option<DataSourceArray> {
        self.metadata.remove(table);
        self.arrays.remove(table).map(|(_, array)| array)
    }

    pub(crate) fn register_wrapper(&self, wrapper: Arc<DataSourceWrapper>) {
        self.wrappers.insert(wrapper.name().to_string(), wrapper);
    }

    pub(crate) fn take_wrapper(&self, name: &str) -> Option<Arc<DataSourceWrapper>> {
        self.wrappers.remove(name).map(|(_, w)| w)
    }

    /// Remove and return every registered wrapper the predicate does not keep
    pub(crate) fn take_wrappers_where(&self, mut keep: impl FnMut(&DataSourceWrapper) -> bool) -> Vec<Arc<DataSourceWrapper>> {
        let names: Vec<String> = self
            .wrappers
            .iter()
            .filter(|e| !keep(e.value()))
            .map(|e| e.key().clone())
            .collect();
        names.into_iter().filter_map(|n| self.take_wrapper(&n)).collect()
    }

    /// Drop everything, returning all registered wrappers
    pub(crate) fn clear(&self) -> Vec<Arc<DataSourceWrapper>> {
        self.arrays.clear();
        self.metadata.clear();
        self.take_wrappers_where(|_| false)
    }
}
