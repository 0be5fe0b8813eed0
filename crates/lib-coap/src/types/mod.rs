mod code;
mod content_format;
mod endpoint;
mod header;
mod message;
mod option;

pub use code::*;
pub use content_format::*;
pub use endpoint::*;
pub use header::*;
pub use message::*;
pub use option::*;
