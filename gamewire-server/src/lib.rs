pub mod config;
pub mod handlers;
pub mod listener;

pub use listener::{Listener, ListenerConfig};
