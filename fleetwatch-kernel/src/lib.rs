pub mod broadcaster;
pub mod config;
pub mod devices;
pub mod health;
pub mod http;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod mqtt;
pub mod presence;
pub mod router;
pub mod store;
