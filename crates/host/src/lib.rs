// pagesync-host library
// Async relay for real-time collaborative document synchronization

// Core sync modules
pub mod hub;
pub mod ledger;
pub mod room;
pub mod ws;

// Document model seam
pub mod model;

// Durable diff storage
pub mod store;

// Sealed session tokens
pub mod auth;

// Configuration
pub mod config;

// REST API
pub mod api;
