#![forbid(unsafe_code)]

pub mod identity;
pub mod ranking;
pub mod store;
pub mod validate;

pub use identity::{MAX_USERNAME_CHARS, apply_override, default_identity};
pub use ranking::{ChannelRank, RankBy};
pub use store::{EvictCause, Evicted, EvictionReport, RelayStore, StoreConfig, StoreError, StoredMessage};
pub use validate::{RejectReason, validate};
