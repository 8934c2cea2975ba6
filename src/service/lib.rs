pub mod config;
pub mod context;
pub mod errors;
pub mod http;
pub mod models;
pub mod persistence;
pub mod policy;
pub mod reconciliation;
pub mod services;
pub mod test;
