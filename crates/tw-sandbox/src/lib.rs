pub mod api;
pub mod codec;
pub mod loader;
pub mod module;
pub mod runtime;
pub mod strategies;

pub use api::*;
pub use codec::*;
pub use loader::*;
pub use module::*;
pub use runtime::*;
pub use strategies::*;
