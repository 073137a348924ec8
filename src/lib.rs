pub mod app;
pub mod artifact;
pub mod audit;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod export;
pub mod output;
pub mod registry;
