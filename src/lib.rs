pub mod assets;
pub mod cleanup;
pub mod config;
pub mod database;
pub mod messaging;
pub mod models;
pub mod node_client;
pub mod node_registry;
pub mod quota;
pub mod routes;
pub mod store;
pub mod worker_processing;
pub mod worker_scheduler;
