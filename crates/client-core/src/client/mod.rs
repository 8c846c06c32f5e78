//! Controller layer: configuration, the call state machine and the
//! [`Softphone`] facade that ties them to the device manager.

pub mod builder;
pub mod calls;
pub mod config;
pub mod controls;
pub mod manager;
pub mod recovery;
pub mod state;

pub use builder::SoftphoneBuilder;
pub use calls::CallMachine;
pub use config::{ClientConfig, ENV_PREFIX};
pub use manager::Softphone;
pub use state::{ControllerState, Diagnostics};

// Re-export recovery utilities
pub use recovery::{retry_with_backoff, with_timeout, RetryConfig};
