//! Queue store implementations

mod in_memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use in_memory::InMemoryQueueStore;
#[cfg(feature = "postgres")]
pub use postgres::PgQueueStore;
