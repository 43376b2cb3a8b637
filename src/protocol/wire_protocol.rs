use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};

/// A message-oriented, ordered, bidirectional channel carrying one JSON object per frame.
/// Both the tracker connection and peer data channels are exposed as a `FrameChannel`,
/// whatever transport sits below.
#[derive(Debug)]
pub struct FrameChannel {
    pub tx: Sender<String>,
    pub rx: Receiver<String>,
}

impl FrameChannel {
    /// Two connected in-memory ends: frames sent on one end are received on the other.
    pub fn pair(capacity: usize) -> (FrameChannel, FrameChannel) {
        let (a_tx, b_rx) = tokio::sync::mpsc::channel(capacity);
        let (b_tx, a_rx) = tokio::sync::mpsc::channel(capacity);
        (
            FrameChannel { tx: a_tx, rx: a_rx },
            FrameChannel { tx: b_tx, rx: b_rx },
        )
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("channel closed")]
    Closed,
    #[error("undecodable frame: {0}")]
    Malformed(String),
}

#[trait_variant::make(Send)]
pub trait ProtocolReadHalf<M> {
    async fn receive(&mut self) -> Result<M>;
}

#[trait_variant::make(Send)]
pub trait ProtocolWriteHalf<M> {
    async fn send(&mut self, message: M) -> Result<()>;
}

impl<M: DeserializeOwned + Send> ProtocolReadHalf<M> for Receiver<String> {
    async fn receive(&mut self) -> Result<M> {
        let frame = match self.recv().await {
            Some(frame) => frame,
            None => return Err(ProtocolError::Closed.into()),
        };
        decode(&frame)
    }
}

impl<M: Serialize + Send> ProtocolWriteHalf<M> for Sender<String> {
    async fn send(&mut self, message: M) -> Result<()> {
        let frame = encode(&message)?;
        if Sender::send(self, frame).await.is_err() {
            return Err(ProtocolError::Closed.into());
        }
        Ok(())
    }
}

pub fn encode<M: Serialize>(message: &M) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode<M: DeserializeOwned>(frame: &str) -> Result<M> {
    serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()).into())
}
