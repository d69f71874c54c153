//! Client-side components: the socket connection manager, the REST client
//! and the reconciling notification store.

pub mod api;
pub mod connection;
pub mod store;

pub use api::{ApiError, NotificationApi, RestNotificationApi};
pub use connection::{
    ClientConfig, ClientError, ClientEvents, ConnectionManager, Identity, LifecycleEvent,
    PresenceEvent, RideEvent,
};
pub use store::{NotificationStore, StoreError};
