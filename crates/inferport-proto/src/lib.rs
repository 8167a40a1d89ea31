//! Wire schema for offloading classification tasks over publish/subscribe.
//!
//! Requests go to [`REQUESTS_TOPIC`]; each device listens for answers on its
//! own [`response_topic`]. Both directions are JSON objects, and the image
//! travels base64-armored. Delivery is at-least-once, so consumers
//! deduplicate on `request_id`.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
