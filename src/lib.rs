pub mod control;
pub mod protocol;

pub use control::{ControlClient, ControlError, StatusRecord};
pub use protocol::{ConnectConfig, MclError, Session, connect};
