//! Auth Module
//!
//! Credential pair, user record and their persisted store.

mod credentials;
mod storage;
mod token_store;

pub use credentials::{CredentialPair, Role, UserRecord};
pub use storage::{FileSlots, MemorySlots, Slot, SlotStorage};
pub use token_store::TokenStore;
