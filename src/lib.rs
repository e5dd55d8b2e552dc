pub mod allocation;
pub mod cache;
pub mod clock;
pub mod config;
pub mod geo;
pub mod layout;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod provider;
pub mod reaper;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod wal;
