pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::{InMemoryStore, InMemorySubscription};
pub use postgres::{PgSubscription, PostgresStore, append_outbox_event};
pub use traits::{
    AccessStore, ChangeFeed, ChangeSubscription, DirectorySource, EffectiveCacheReader,
    EffectiveCacheWriter, OutboxStore, PermissionSource, SecuritySource, StorageError, Wake,
};
