//! Local storage: the in-memory data container and the persistent store.

mod data_container;
mod persistence;

pub use data_container::{DataContainer, MokaDataContainer};
pub use persistence::{InMemoryPersistence, PersistenceManager};
