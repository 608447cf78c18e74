pub mod database;
pub mod error;
pub mod schema;
pub mod store;
pub mod tier;

pub use database::Database;
pub use error::StoreError;
pub use store::{ChangeEvent, StateStore, TierUsage};
pub use tier::{StoreQuotas, Tier, TierQuota};
