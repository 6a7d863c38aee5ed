//! Classification of inbound messages by the kind of peer that sends them.
//!
//! There is no credential exchange: the verb decides the sender category,
//! and the category decides what may run while the node is stopped.

use crate::protocol::StatusType;

/// Sender category of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    /// End-user client
    Client,
    /// Another key-value server
    Server,
    /// The coordinator (ECS)
    Coordinator,
    /// Any of the above
    Any,
}

impl PeerType {
    /// Category that sends `status`
    pub fn of(status: StatusType) -> Self {
        use StatusType::*;
        match status {
            Get | Put | Delete | Keyrange | KeyrangeRead => PeerType::Client,
            GetSuccess | GetError | PutSuccess | PutUpdate | PutError | DeleteSuccess
            | DeleteError | PutServer | KeyrangeSuccess | KeyrangeReadSuccess
            | ServerNotResponsible | ServerStopped | ServerWriteLock | ServerWriteUnlock
            | ServerHandoffSuccess | ServerAck | ServerHeartBeat | ServerStart
            | ServerShutdown => PeerType::Server,
            EcsWriteLock | EcsWriteUnlock | EcsHandoff | EcsSetKeyrange | EcsHeartBeat
            | EcsAck | EcsWaitingForHandoff => PeerType::Coordinator,
            Error => PeerType::Any,
        }
    }

    /// Whether messages from this category run on a stopped node
    pub fn bypasses_stop(&self) -> bool {
        !matches!(self, PeerType::Client)
    }
}
