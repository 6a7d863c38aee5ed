//! Line-oriented wire messages.
//!
//! Every message is one line of text: `<status> [key] [value]`. The status
//! and key are single tokens; whatever follows the key is the value, kept
//! verbatim so values may contain spaces.

use ringkv_core::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Message verbs and reply statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
    Get,
    GetSuccess,
    GetError,
    Put,
    PutSuccess,
    PutUpdate,
    PutError,
    Delete,
    DeleteSuccess,
    DeleteError,
    /// Server-origin PUT carrying migrated data
    PutServer,
    Keyrange,
    KeyrangeSuccess,
    /// Request for the arcs each member serves reads for
    KeyrangeRead,
    KeyrangeReadSuccess,
    /// Reply carrying the current ring metadata
    ServerNotResponsible,
    ServerStopped,
    ServerWriteLock,
    ServerWriteUnlock,
    ServerHandoffSuccess,
    ServerAck,
    ServerHeartBeat,
    ServerStart,
    ServerShutdown,
    EcsWriteLock,
    EcsWriteUnlock,
    EcsHandoff,
    EcsSetKeyrange,
    EcsHeartBeat,
    EcsAck,
    EcsWaitingForHandoff,
    Error,
}

impl StatusType {
    /// Every status, in wire-table order
    pub const ALL: [StatusType; 32] = [
        StatusType::Get,
        StatusType::GetSuccess,
        StatusType::GetError,
        StatusType::Put,
        StatusType::PutSuccess,
        StatusType::PutUpdate,
        StatusType::PutError,
        StatusType::Delete,
        StatusType::DeleteSuccess,
        StatusType::DeleteError,
        StatusType::PutServer,
        StatusType::Keyrange,
        StatusType::KeyrangeSuccess,
        StatusType::KeyrangeRead,
        StatusType::KeyrangeReadSuccess,
        StatusType::ServerNotResponsible,
        StatusType::ServerStopped,
        StatusType::ServerWriteLock,
        StatusType::ServerWriteUnlock,
        StatusType::ServerHandoffSuccess,
        StatusType::ServerAck,
        StatusType::ServerHeartBeat,
        StatusType::ServerStart,
        StatusType::ServerShutdown,
        StatusType::EcsWriteLock,
        StatusType::EcsWriteUnlock,
        StatusType::EcsHandoff,
        StatusType::EcsSetKeyrange,
        StatusType::EcsHeartBeat,
        StatusType::EcsAck,
        StatusType::EcsWaitingForHandoff,
        StatusType::Error,
    ];

    /// Wire token of this status
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusType::Get => "get",
            StatusType::GetSuccess => "get_success",
            StatusType::GetError => "get_error",
            StatusType::Put => "put",
            StatusType::PutSuccess => "put_success",
            StatusType::PutUpdate => "put_update",
            StatusType::PutError => "put_error",
            StatusType::Delete => "delete",
            StatusType::DeleteSuccess => "delete_success",
            StatusType::DeleteError => "delete_error",
            StatusType::PutServer => "put_server",
            StatusType::Keyrange => "keyrange",
            StatusType::KeyrangeSuccess => "keyrange_success",
            StatusType::KeyrangeRead => "keyrange_read",
            StatusType::KeyrangeReadSuccess => "keyrange_read_success",
            StatusType::ServerNotResponsible => "server_not_responsible",
            StatusType::ServerStopped => "server_stopped",
            StatusType::ServerWriteLock => "server_write_lock",
            StatusType::ServerWriteUnlock => "server_write_unlock",
            StatusType::ServerHandoffSuccess => "server_handoff_success",
            StatusType::ServerAck => "server_ack",
            StatusType::ServerHeartBeat => "server_heart_beat",
            StatusType::ServerStart => "server_start",
            StatusType::ServerShutdown => "server_shutdown",
            StatusType::EcsWriteLock => "ecs_write_lock",
            StatusType::EcsWriteUnlock => "ecs_write_unlock",
            StatusType::EcsHandoff => "ecs_handoff",
            StatusType::EcsSetKeyrange => "ecs_set_keyrange",
            StatusType::EcsHeartBeat => "ecs_heart_beat",
            StatusType::EcsAck => "ecs_ack",
            StatusType::EcsWaitingForHandoff => "ecs_waiting_for_handoff",
            StatusType::Error => "error",
        }
    }

    /// Whether a PUT reply reports the value as stored
    pub fn is_stored(&self) -> bool {
        matches!(self, StatusType::PutSuccess | StatusType::PutUpdate)
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim().to_ascii_lowercase();
        StatusType::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == token)
            .ok_or_else(|| Error::MalformedMessage(format!("Unknown status '{}'", s.trim())))
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvMessage {
    status: StatusType,
    key: Option<String>,
    value: Option<String>,
}

impl KvMessage {
    /// Message with only a status
    pub fn new(status: StatusType) -> Self {
        Self {
            status,
            key: None,
            value: None,
        }
    }

    /// Message with a status and key
    pub fn with_key(status: StatusType, key: impl Into<String>) -> Self {
        Self {
            status,
            key: Some(key.into()),
            value: None,
        }
    }

    /// Message with a status, key and value
    pub fn with_value(status: StatusType, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            status,
            key: Some(key.into()),
            value: Some(value.into()),
        }
    }

    pub fn status(&self) -> StatusType {
        self.status
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Key, or a [`Error::MalformedMessage`] naming the status
    pub fn require_key(&self) -> Result<&str> {
        self.key().ok_or_else(|| {
            Error::MalformedMessage(format!("'{}' requires a key", self.status))
        })
    }

    /// Value, or a [`Error::MalformedMessage`] naming the status
    pub fn require_value(&self) -> Result<&str> {
        self.value().ok_or_else(|| {
            Error::MalformedMessage(format!("'{}' requires a value", self.status))
        })
    }

    /// Parse one line, without its terminator
    pub fn parse(line: &str) -> Result<Self> {
        let (status, rest) = split_token(line.trim());
        if status.is_empty() {
            return Err(Error::MalformedMessage("Empty message".to_string()));
        }
        let status = status.parse()?;
        let (key, value) = split_token(rest);

        Ok(Self {
            status,
            key: (!key.is_empty()).then(|| key.to_string()),
            value: (!value.is_empty()).then(|| value.to_string()),
        })
    }
}

impl fmt::Display for KvMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if let Some(key) = &self.key {
            write!(f, " {}", key)?;
            if let Some(value) = &self.value {
                write!(f, " {}", value)?;
            }
        }
        Ok(())
    }
}

impl FromStr for KvMessage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        KvMessage::parse(s)
    }
}

/// First whitespace-delimited token and the rest with leading space removed
fn split_token(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(end) => (&text[..end], text[end..].trim_start()),
        None => (text, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_put_keeps_value_verbatim() {
        let msg = KvMessage::parse("put  greeting   hello  big world\n").unwrap();
        assert_eq!(msg.status(), StatusType::Put);
        assert_eq!(msg.key(), Some("greeting"));
        assert_eq!(msg.value(), Some("hello  big world"));
        assert_eq!(msg.to_string(), "put greeting hello  big world");
    }

    #[test]
    fn test_put_without_value_is_a_delete() {
        let msg = KvMessage::parse("put key").unwrap();
        assert_eq!(msg.key(), Some("key"));
        assert_eq!(msg.value(), None);
    }

    #[test]
    fn test_status_only() {
        let msg = KvMessage::parse("ecs_heart_beat").unwrap();
        assert_eq!(msg, KvMessage::new(StatusType::EcsHeartBeat));
        assert_eq!(msg.to_string(), "ecs_heart_beat");
    }

    #[test]
    fn test_every_status_token_parses_back() {
        for status in StatusType::ALL {
            assert_eq!(status.as_str().parse::<StatusType>().unwrap(), status);
        }
        assert_eq!("GET".parse::<StatusType>().unwrap(), StatusType::Get);
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            KvMessage::parse("   "),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            KvMessage::parse("fetch key"),
            Err(Error::MalformedMessage(_))
        ));
        let msg = KvMessage::parse("get").unwrap();
        assert!(msg.require_key().is_err());
    }

    #[test]
    fn test_handoff_message_layout() {
        let msg = KvMessage::with_value(StatusType::EcsHandoff, "127.0.0.1:5001", "0x33 0x46");
        let parsed = KvMessage::parse(&msg.to_string()).unwrap();
        assert_eq!(parsed.key(), Some("127.0.0.1:5001"));
        assert_eq!(parsed.value(), Some("0x33 0x46"));
    }
}
