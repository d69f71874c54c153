//! Notification model, persistence, fan-out and REST surface.

pub mod dispatcher;
pub mod events;
pub mod model;
pub mod retention;
pub mod routes;
pub mod store;
