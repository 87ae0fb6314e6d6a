//! HTTP API for crmgate-sync

pub mod access;
pub mod batch;
pub mod health;
pub mod sse;
pub mod users;
pub mod webhook;

pub use access::access_routes;
pub use batch::batch_routes;
pub use health::health_routes;
pub use sse::event_stream;
pub use users::user_routes;
pub use webhook::webhook_routes;
