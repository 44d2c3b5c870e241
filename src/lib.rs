pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod indexer;
pub mod join;
pub mod query;
pub mod scheduler;
