//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod remote;
pub mod telemetry;

pub use error::InfraError;
pub use remote::{InMemoryRemoteTier, RemoteError, RemoteTier};
