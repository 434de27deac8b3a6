pub mod error;
pub mod instance;
pub mod messages;


pub use error::{Result, StitchError};
pub use instance::{InstanceKey, ServiceInstance};
pub use messages::{ErrorBody, RegisterAck, RegistryInfo};
