use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::error::FederationError;
use crate::models::FederationDefinitions;

/// Source of the desired logical tables, data sources and static peers
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<Arc<FederationDefinitions>, FederationError>;
}

/// Definitions file (TOML, JSON or YAML by extension), re-read on every load
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(path: &PathBuf) -> Result<FederationDefinitions, FederationError> {
        let definitions = config::Config::builder()
            .add_source(config::File::from(path.as_path()))
            .build()?
            .try_deserialize()?;
        Ok(definitions)
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<Arc<FederationDefinitions>, FederationError> {
        let path = self.path.clone();
        let definitions = tokio::task::spawn_blocking(move || Self::read(&path))
            .await
            .map_err(|e| FederationError::Config(format!("Definitions load task failed: {}", e)))??;
        tracing::debug!(
            "Loaded {} logical table(s) and {} peer(s) from {}",
            definitions.tables.len(),
            definitions.peers.len(),
            self.path.display()
        );
        Ok(Arc::new(definitions))
    }
}

/// Definitions held in memory, replaced wholesale by the embedding code
#[derive(Default)]
pub struct MemoryConfigSource {
    definitions: RwLock<Arc<FederationDefinitions>>,
}

impl MemoryConfigSource {
    pub fn new(definitions: FederationDefinitions) -> Self {
        Self {
            definitions: RwLock::new(Arc::new(definitions)),
        }
    }

    pub fn set(&self, definitions: FederationDefinitions) {
        *self.definitions.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(definitions);
    }

    /// Edit a copy of the current definitions and install it
    pub fn update(&self, f: impl FnOnce(&mut FederationDefinitions)) {
        let mut guard = self.definitions.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn load(&self) -> Result<Arc<FederationDefinitions>, FederationError> {
        Ok(self
            .definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EndpointDescriptor;
    use std::io::Write;
    use tempfile::Builder;

    #[tokio::test]
    async fn test_file_source_reads_toml() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[tables.orders]
columns = "id INT, amount DOUBLE"

[[tables.orders.sources]]
name = "eu"
endpoint = {{ type = "relational", url = "sqlite:/data/eu.db" }}
options = {{ in_memory = true }}

[[peers]]
id = "n2"
endpoint = {{ type = "relational", url = "http://n2:3000", user = "gdb", password = "gdb" }}
"#
        )
        .unwrap();

        let source = FileConfigSource::new(file.path());
        let defs = source.load().await.unwrap();
        let orders = &defs.tables["orders"];
        assert_eq!(orders.sources.len(), 1);
        assert_eq!(orders.sources[0].endpoint, EndpointDescriptor::relational("sqlite:/data/eu.db", None, None));
        assert!(orders.sources[0].options.in_memory);
        assert_eq!(defs.peers[0].id, "n2");
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let source = FileConfigSource::new("/no/such/definitions.toml");
        assert!(matches!(source.load().await, Err(FederationError::Config(_))));
    }

    #[tokio::test]
    async fn test_memory_source_update() {
        let source = MemoryConfigSource::default();
        assert!(source.load().await.unwrap().tables.is_empty());
        source.update(|d| {
            d.tables.insert("t".to_string(), Default::default());
        });
        assert!(source.load().await.unwrap().tables.contains_key("t"));
    }
}
