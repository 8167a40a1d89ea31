pub mod backend;
pub mod envelope;
pub mod error;
pub mod labels;
pub mod model;
pub mod spec;
pub mod strategy;
pub mod tensor;

pub use backend::*;
pub use envelope::*;
pub use error::*;
pub use labels::*;
pub use model::*;
pub use spec::*;
pub use strategy::*;
pub use tensor::*;
