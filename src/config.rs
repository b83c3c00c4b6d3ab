use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::services::endpoint_pool::PoolSettings;
use crate::services::health_monitor::NodeIdentity;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub node: NodeConfig,
    pub pool: PoolConfig,
    pub health: HealthConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub user: String,
    pub password: String,
    /// A lite node has no full query capability of its own
    pub lite: bool,
    #[serde(default)]
    pub ssl_mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub max_size: usize,
    pub min_connect_timeout_ms: u64,
    pub first_connect_grace_ms: u64,
    pub validation_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub heartbeat_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Definitions document; an empty path starts the node with no tables
    pub definitions_path: String,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("node.id", uuid::Uuid::new_v4().to_string())?
            .set_default("node.user", "gaiandb")?
            .set_default("node.password", "passw0rd")?
            .set_default("node.lite", false)?
            .set_default("pool.max_size", 10)?
            .set_default("pool.min_connect_timeout_ms", 200)?
            .set_default("pool.first_connect_grace_ms", 5000)?
            .set_default("pool.validation_timeout_ms", 2000)?
            .set_default("health.heartbeat_ms", 5000)?
            .set_default("federation.definitions_path", "./federation.toml")?
            .set_default("federation.refresh_interval_secs", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?;

        // Load from environment variables
        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port.parse::<u16>().unwrap_or(3000))?;
        }

        if let Ok(node_id) = env::var("NODE_ID") {
            builder = builder.set_override("node.id", node_id)?;
        }

        if let Ok(lite) = env::var("NODE_LITE") {
            builder = builder.set_override("node.lite", matches!(lite.to_lowercase().as_str(), "1" | "true" | "yes"))?;
        }

        if let Ok(user) = env::var("NODE_USER") {
            builder = builder.set_override("node.user", user)?;
        }

        if let Ok(password) = env::var("NODE_PASSWORD") {
            builder = builder.set_override("node.password", password)?;
        }

        if let Ok(ssl_mode) = env::var("NODE_SSL_MODE") {
            builder = builder.set_override("node.ssl_mode", Some(ssl_mode))?;
        }

        if let Ok(max_size) = env::var("MAX_POOL_SIZE") {
            builder = builder.set_override("pool.max_size", max_size.parse::<u64>().unwrap_or(10))?;
        }

        if let Ok(heartbeat) = env::var("HEARTBEAT_MS") {
            builder = builder.set_override("health.heartbeat_ms", heartbeat.parse::<u64>().unwrap_or(5000))?;
        }

        if let Ok(path) = env::var("FEDERATION_DEFINITIONS") {
            builder = builder.set_override("federation.definitions_path", path)?;
        }

        if let Ok(interval) = env::var("REFRESH_INTERVAL_SECS") {
            builder = builder.set_override("federation.refresh_interval_secs", interval.parse::<u64>().unwrap_or(30))?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.pool.max_size.max(1),
            min_connect_timeout: Duration::from_millis(self.pool.min_connect_timeout_ms),
            first_connect_grace: Duration::from_millis(self.pool.first_connect_grace_ms),
            validation_timeout: Duration::from_millis(self.pool.validation_timeout_ms),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.health.heartbeat_ms.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.federation.refresh_interval_secs.max(1))
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            node_id: self.node.id.clone(),
            user: self.node.user.clone(),
            password: self.node.password.clone(),
            ssl_mode: self.node.ssl_mode.clone(),
        }
    }
}

#[cfg(test)]
impl Config {
    /// Defaults without consulting the environment
    pub fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            node: NodeConfig {
                id: "n0".to_string(),
                user: "gdb".to_string(),
                password: "secret".to_string(),
                lite: false,
                ssl_mode: None,
            },
            pool: PoolConfig {
                max_size: 10,
                min_connect_timeout_ms: 200,
                first_connect_grace_ms: 5000,
                validation_timeout_ms: 2000,
            },
            health: HealthConfig { heartbeat_ms: 100 },
            federation: FederationConfig {
                definitions_path: String::new(),
                refresh_interval_secs: 30,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                style: "auto".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        // Clear environment variables for this test
        env::remove_var("HOST");
        env::remove_var("PORT");
        env::remove_var("MAX_POOL_SIZE");
        env::remove_var("HEARTBEAT_MS");

        let config = Config::from_env();
        assert!(config.is_ok());

        let config = config.unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.heartbeat(), Duration::from_secs(5));
        assert!(!config.node.id.is_empty());
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::for_tests();
        let pool = config.pool_settings();
        assert_eq!(pool.min_connect_timeout, Duration::from_millis(200));
        assert_eq!(pool.first_connect_grace, Duration::from_secs(5));
        assert_eq!(config.identity().node_id, "n0");
        assert_eq!(config.server_address(), "127.0.0.1:0");
    }
}
