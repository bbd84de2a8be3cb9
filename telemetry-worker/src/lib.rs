pub mod checkpoint;
pub mod config;
pub mod error;
pub mod ingest;
pub mod purge;
pub mod sink;
pub mod source;
pub mod supervisor;
pub mod tracker;
