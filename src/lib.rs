pub mod broker;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod service;
pub mod status_store;
pub mod store;
