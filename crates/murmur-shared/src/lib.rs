// Identity types, wire protocol and limits shared by the chat server and its clients.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ProtocolError, UsernameError};
pub use protocol::{ClientEnvelope, ServerEnvelope};
pub use types::{ConnectionId, ConversationKey, DeliveryStatus, Username};
