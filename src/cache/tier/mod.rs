//! Cache tier collaborator interfaces and built-in stores

pub mod local;
pub mod remote;

pub use local::{InMemoryLocalStore, LocalStore};
pub use remote::{InMemoryRemoteStore, RemoteStore};
