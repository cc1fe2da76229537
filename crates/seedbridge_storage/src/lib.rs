mod repository;

pub use repository::{
    ClaimOutcome, ClaimState, ClaimStore, SqliteClaimStore, StorageConfig,
};
