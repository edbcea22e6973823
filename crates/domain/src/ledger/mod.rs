//! Collaborator contracts for ledger clients. Clients are constructed by the
//! composing application and injected into adapters; nothing in this
//! workspace owns a global client.

mod traits;

pub use traits::*;
