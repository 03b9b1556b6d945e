//! Out-of-process data collection.

pub mod coordinator;

pub use coordinator::DataCollectionCoordinator;
