//! Hub-side identity and provisioning.

mod config_sync;
mod keys;

pub use config_sync::*;
pub use keys::*;

/// Version reported by the key endpoint and in agent greetings.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
