pub mod app;
pub mod auth;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod error;
pub mod escalation;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod tickets;
pub mod types;
pub mod upstream;
