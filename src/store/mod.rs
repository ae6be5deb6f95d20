pub mod context;
pub mod feed;
pub mod memory;
pub mod traits;

pub use context::SerialContext;
pub use feed::{ChangeFeed, ListenerId};
pub use memory::{MemoryEntity, MemoryStore, Transaction};
pub use traits::{
    EntityHandle, ObjectStore, Task, WatchCallback, WatchEvent, WatchKind, WatchToken,
};
