//! Interface to the remote seedbox service plus an in-memory implementation.

mod client;
mod memory;
mod walk;

pub use client::{PayloadUploader, RemoteEntry, RemoteError, SeedboxClient};
pub use memory::InMemorySeedboxClient;
pub use walk::{fetch_tagged_transfers, resolve_files};
