//! Individual peer session handling

use anyhow::{anyhow, Result};
use bytes::Bytes;
use fleet_shared::{
    codec::{self, FrameDecoder},
    Message,
};
use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Frames queued per peer before senders wait
const OUTBOUND_QUEUE: usize = 256;

/// What a connected peer is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// A managed device that runs scripts
    Device,
    /// An operator console
    Controller,
}

impl PeerRole {
    /// Parse the role announced in a hello message
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "device" => Some(Self::Device),
            "controller" => Some(Self::Controller),
            _ => None,
        }
    }
}

/// Handle to send messages to a specific peer
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub peer_id: String,
    pub role: PeerRole,
    pub addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    pub connected_at: Instant,
}

impl SessionHandle {
    pub fn new(
        peer_id: impl Into<String>,
        role: PeerRole,
        addr: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            role,
            addr,
            outbound,
            connected_at: Instant::now(),
        }
    }

    /// Frame and queue an already-serialized message
    pub async fn send_payload(&self, payload: &[u8]) -> Result<()> {
        queue_frame(&self.outbound, payload, &self.peer_id).await
    }

    /// Send a message to this peer
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_payload(&codec::to_payload(message)?).await
    }

    /// Check if the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Whether both handles feed the same connection
    pub fn same_connection(&self, other: &SessionHandle) -> bool {
        self.outbound.same_channel(&other.outbound)
    }
}

/// Active peer connection: a framed reader plus a writer task fed by a queue
pub struct PeerSession {
    addr: SocketAddr,
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    outbound: mpsc::Sender<Bytes>,
    writer_task: JoinHandle<()>,
}

impl PeerSession {
    /// Wrap a connected stream and start its writer task
    pub fn new<S>(stream: S, addr: SocketAddr) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut queue) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    debug!("Write error to {}: {}", addr, e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self {
            addr,
            reader: Box::new(reader),
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
            outbound,
            writer_task,
        }
    }

    /// Get a cloneable handle for sending messages once the peer is identified
    pub fn handle(&self, peer_id: impl Into<String>, role: PeerRole) -> SessionHandle {
        SessionHandle::new(peer_id, role, self.addr, self.outbound.clone())
    }

    /// Send a message before the peer has a handle (e.g. a refused hello)
    pub async fn send(&self, message: &Message) -> Result<()> {
        queue_frame(&self.outbound, &codec::to_payload(message)?, self.addr).await
    }

    /// Read the next message from this session
    /// Returns None if the connection is closed or sent garbage
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.decoder.decode_next() {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(e) => {
                    warn!("Decode error from {}: {}", self.addr, e);
                    return None;
                }
            }

            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None,
                Ok(n) => self.decoder.extend(&self.read_buf[..n]),
                Err(e) => {
                    warn!("Read error from {}: {}", self.addr, e);
                    return None;
                }
            }
        }
    }

    /// Get the remote address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop reading and wait for queued frames to be written
    ///
    /// The writer finishes once every handle to this session is dropped.
    pub async fn close(self) {
        let Self {
            outbound,
            writer_task,
            ..
        } = self;
        drop(outbound);
        let _ = writer_task.await;
    }
}

/// Frame `payload` and queue it for the writer task
async fn queue_frame(
    outbound: &mpsc::Sender<Bytes>,
    payload: &[u8],
    peer: impl Display,
) -> Result<()> {
    let frame = codec::encode_frame(payload)?;
    outbound
        .send(frame)
        .await
        .map_err(|_| anyhow!("Session closed: {}", peer))
}
