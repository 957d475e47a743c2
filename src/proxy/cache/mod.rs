mod flight;
mod store;

pub use flight::{FlightRole, MissCoalescer};
pub use store::{CacheStore, StorageError, TEMP_PREFIX};
