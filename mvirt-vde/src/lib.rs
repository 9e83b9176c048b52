pub mod api;
pub mod config;
pub mod error;
pub mod gc;
pub mod host;
pub mod ipam;
pub mod network;
pub mod process;
pub mod protocol;
pub mod state;
pub mod test_util;

pub use error::{DriverError, ErrorKind, Result};
pub use ipam::IpamDriver;
pub use network::NetworkDriver;
pub use state::DriverState;
