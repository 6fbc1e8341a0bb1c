mod client;
mod config;
mod reading_sink;

pub use client::*;
pub use config::*;
pub use reading_sink::*;
