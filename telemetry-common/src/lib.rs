pub mod event;
pub mod executor;
pub mod influx;
pub mod metrics;
pub mod retry;
pub mod sanitize;
pub mod store;
