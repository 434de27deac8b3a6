pub mod http_server;
pub mod registry;

pub use http_server::RegistryServer;
pub use registry::{Registry, RegistryConfig};
