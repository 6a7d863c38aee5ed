//! Connections carrying protocol messages, one per line.

use crate::protocol::KvMessage;
use async_trait::async_trait;
use ringkv_core::{Error, NodeId, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

/// Greeting prefix a server sends on every accepted connection
pub const WELCOME_PREFIX: &str = "ringkv";

/// Longest line accepted from a peer, terminator included
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// An open message connection to one peer.
#[async_trait]
pub trait Transport: Send {
    /// Send one message
    async fn send(&mut self, message: &KvMessage) -> Result<()>;

    /// Wait for the next message
    async fn receive(&mut self) -> Result<KvMessage>;

    /// Send `message` and wait for the reply
    async fn request(&mut self, message: &KvMessage) -> Result<KvMessage> {
        self.send(message).await?;
        self.receive().await
    }

    /// Close the connection
    async fn disconnect(&mut self) -> Result<()>;
}

/// Opens [`Transport`]s to peers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, peer: &NodeId) -> Result<Box<dyn Transport>>;
}

/// Newline-delimited messages over TCP
pub struct TcpTransport {
    peer: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Option<Duration>,
}

impl TcpTransport {
    /// Wrap an established stream
    pub fn new(stream: TcpStream, timeout: Option<Duration>) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            reader: BufReader::new(reader),
            writer,
            timeout,
        }
    }

    /// Connect to `peer`, optionally consuming its welcome line
    pub async fn connect(peer: &NodeId, timeout: Option<Duration>, welcome: bool) -> Result<Self> {
        let target = (peer.address(), peer.port());
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(target))
                .await
                .map_err(|_| {
                    Error::Communication(format!("Timed out connecting to {}", peer))
                })?,
            None => TcpStream::connect(target).await,
        }
        .map_err(|e| Error::Communication(format!("Could not connect to {}: {}", peer, e)))?;

        let mut transport = Self::new(stream, timeout);
        if welcome {
            let greeting = transport.read_line().await?.ok_or_else(|| {
                Error::Communication(format!("{} closed the connection before greeting", peer))
            })?;
            trace!(peer = %peer, greeting = %greeting, "Received welcome");
        }
        Ok(transport)
    }

    /// Address of the remote end
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Next line without its terminator, `None` once the peer closed.
    ///
    /// Fails with [`Error::MalformedMessage`] once a line runs past
    /// [`MAX_LINE_LENGTH`] bytes without a terminator.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let mut bounded = (&mut self.reader).take(MAX_LINE_LENGTH as u64);
        let read = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, bounded.read_line(&mut line))
                .await
                .map_err(|_| {
                    Error::Communication(format!("Timed out waiting for {}", self.peer))
                })?,
            None => bounded.read_line(&mut line).await,
        }?;

        if read == 0 {
            return Ok(None);
        }
        if read >= MAX_LINE_LENGTH && !line.ends_with('\n') {
            return Err(Error::MalformedMessage(format!(
                "{} sent a line longer than {} bytes",
                self.peer, MAX_LINE_LENGTH
            )));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        Ok(Some(trimmed.to_string()))
    }

    /// Write one line, appending the terminator
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        self.writer.write_all(framed.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, message: &KvMessage) -> Result<()> {
        trace!(peer = %self.peer, message = %message, "Sending");
        self.write_line(&message.to_string()).await
    }

    async fn receive(&mut self) -> Result<KvMessage> {
        match self.read_line().await? {
            Some(line) => KvMessage::parse(&line),
            None => Err(Error::Communication(format!(
                "{} closed the connection",
                self.peer
            ))),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Opens [`TcpTransport`]s
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Option<Duration>,
    welcome: bool,
}

impl TcpConnector {
    /// Connector for key-value servers, which greet every connection
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            welcome: true,
        }
    }

    /// Connector for the coordinator, which sends no greeting
    pub fn without_welcome(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            welcome: false,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, peer: &NodeId) -> Result<Box<dyn Transport>> {
        let transport = TcpTransport::connect(peer, self.timeout, self.welcome).await?;
        Ok(Box::new(transport))
    }
}
