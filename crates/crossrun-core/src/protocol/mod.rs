//! Wire protocol: message envelope, stream framing, and the duplex
//! message channel a coordinator and a worker exchange frames over.

pub mod channel;
pub mod frame;
pub mod message;

pub use channel::{ConnectionInfo, ConnectionRole, MessageChannel, Transport};
pub use frame::{read_frame, write_frame};
pub use message::{
    message_type, AfterRunEndPayload, AfterRunEndResult, AttachmentSet, BeforeRunStartPayload,
    BeforeRunStartResult, DiscoveryCompletePayload, DiscoveryCriteria, Message, RunCompletePayload,
    RunCriteria, RunItems, RunStats, VersionCheckPayload,
};
