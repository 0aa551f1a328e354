pub mod host;
pub mod isolation;

pub use host::{ExitNotice, ManagedProcess, ProcessHost, SpawnedProcess};
pub use isolation::{ResourceGroup, ResourceLimits};
