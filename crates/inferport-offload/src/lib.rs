pub mod client;
pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod transport;

pub use client::*;
pub use memory::*;
#[cfg(feature = "mqtt")]
pub use mqtt::*;
pub use transport::*;
