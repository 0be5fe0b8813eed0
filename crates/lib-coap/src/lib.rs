pub mod types;

mod client;
mod constants;

pub use client::*;
pub use constants::*;
