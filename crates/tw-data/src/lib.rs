pub mod cache;
pub mod source;

pub use cache::*;
pub use source::*;
