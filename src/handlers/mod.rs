pub mod chat;
pub mod config;
pub mod lens;

pub use chat::*;
pub use config::*;
pub use lens::*;
