//! Collaborator seams: the runtime provider that knows how to start a
//! worker for a set of sources, and the extension cache workers are
//! seeded from.

pub mod extensions;
pub mod provider;

pub use extensions::ExtensionCache;
pub use provider::{
    DefaultRuntimeProvider, DiagOptions, ProcessWorkerHandle, RuntimeProvider, StartInfo,
    WorkerHandle,
};
