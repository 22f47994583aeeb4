pub mod control;
pub mod error;
pub mod frame;

pub use control::ControlProtocol;
pub use error::ProtocolError;
pub use frame::{Frame, MessageType};
