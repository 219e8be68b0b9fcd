//! Credential pool: rotation, validity tracking and persistence.

mod pool;
mod store;

pub use pool::KeyPool;
pub use store::{
    mask_key, CredentialRecord, JsonFileKeyStore, KeyPoolState, KeyStatus, KeyStore,
    MemoryKeyStore,
};
