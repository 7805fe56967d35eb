//! Code Sync Proxy - Common Library
//!
//! Shared types, the binary wire protocol, and configuration parsing used
//! by the relay daemon and by clients speaking to it.

pub mod config;
pub mod message;
pub mod protocol;
pub mod types;

pub use message::MessageFactory;
pub use protocol::{
    DatabaseBranchUpdate, Envelope, MessageType, ProtocolError, PushMessage, PushResponse,
    PushResponseStatus, VerificationRequest, VerificationResponse, VerificationStatus,
    WebsocketMessage,
};
pub use types::{
    ConnectionKey, ConnectionRole, PushRecord, PushStatus, STANDALONE_ID, WorkerId,
};
