pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod indexer;
pub mod models;
pub mod monitoring;
pub mod proxy;
pub mod rag;
