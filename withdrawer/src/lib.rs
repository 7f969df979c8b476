pub mod api;
pub mod cli;
pub mod config;
pub mod contract;
pub mod errors;
pub mod inventory;
pub mod message;
pub mod orchestrator;
pub mod session;
pub mod tracing;
pub mod types;
pub mod verification;
pub mod wallet;
pub mod web;
