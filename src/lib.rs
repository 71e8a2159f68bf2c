pub mod channel;
pub mod config;
pub mod dispatch;
pub mod hop;
pub mod pipe;
pub mod recorder;
pub mod server;
pub mod shared;
pub mod ssh;
pub mod utils;

pub use config::HopgateConfig;
pub use dispatch::{DispatchRequest, Dispatcher, NewChannel};
pub use hop::{HopChain, HopDescriptor, HopError};
pub use server::BastionServer;
pub use shared::{AuthenticatedIdentity, BastionError, SessionId};
