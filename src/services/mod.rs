pub mod config_source;
pub mod connectors; // Backend connectors producing source handles
pub mod discovery;
pub mod endpoint_pool;
pub mod health_monitor;
pub mod node;
pub mod registry;
pub mod reload;
pub mod views; // DataFusion views of the logical tables
pub mod wrapper;

#[cfg(test)]
pub mod testing;

pub use config_source::*;
pub use discovery::*;
pub use endpoint_pool::*;
pub use health_monitor::*;
pub use node::*;
pub use registry::*;
pub use reload::*;
pub use views::*;
pub use wrapper::*;
