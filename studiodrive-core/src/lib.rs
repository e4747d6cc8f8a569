mod client;
mod memory;
mod records;
mod remote;

pub use client::{HttpBackend, HttpTimeouts};
pub use memory::MemoryBackend;
pub use records::{
    ChangeBatch, ChangeKind, ChangeScope, Identity, ItemCategory, ItemWrite, Project,
    ProjectAction, RemoteChange, RemoteItem, UnknownCategory,
};
pub use remote::{ApiErrorClass, BackendError, IdentityProvider, MetadataStore, ObjectStore};
