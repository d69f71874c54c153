//! Real-time notification and presence layer for the ride-sharing platform.
//! The server binary entry point is in main.rs; `client` holds the library
//! side used by rider and driver apps.

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod notifications;
pub mod presence;
pub mod proto;
pub mod rides;
pub mod routes;
pub mod state;
pub mod ws;
