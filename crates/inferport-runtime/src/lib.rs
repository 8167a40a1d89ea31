pub mod manager;
pub mod preprocess;
pub mod request;
pub mod router;

pub use manager::*;
pub use preprocess::*;
pub use request::*;
pub use router::*;
