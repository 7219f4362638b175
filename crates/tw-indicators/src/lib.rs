pub mod builtin;
pub mod registry;
pub mod signal;

pub use builtin::*;
pub use registry::*;
pub use signal::*;
