use std::time::Duration;

use anyhow::{bail, Result};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

use crate::protocol::{
    tcp_frames,
    tracker_messages::TrackerMessage,
    wire_protocol::{FrameChannel, ProtocolWriteHalf},
    ParticipantId,
};

pub static DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub static DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub static DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);
pub static DEFAULT_BACKOFF_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
#[error("tracker connection failed: {0}")]
pub struct ConnectionError(pub String);

/// Opens the control connection to the tracker and performs the hello exchange.
#[trait_variant::make(Send)]
pub trait TrackerConnector {
    async fn connect(&self, participant_id: ParticipantId) -> Result<FrameChannel>;
}

#[derive(Clone)]
pub struct TcpTrackerConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpTrackerConnector {
    pub fn new(addr: String, connect_timeout: Duration) -> Self {
        TcpTrackerConnector {
            addr,
            connect_timeout,
        }
    }
}

impl TrackerConnector for TcpTrackerConnector {
    async fn connect(&self, participant_id: ParticipantId) -> Result<FrameChannel> {
        log::debug!("connecting to tracker {}...", self.addr);
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Err(_elapsed) => bail!(ConnectionError(format!(
                "timed out connecting to {} after {:?}",
                self.addr, self.connect_timeout
            ))),
            Ok(Err(e)) => bail!(ConnectionError(format!("{}: {e}", self.addr))),
            Ok(Ok(stream)) => stream,
        };
        let mut channel = tcp_frames::bridge(stream, format!("tracker {}", self.addr));
        if let Err(e) = ProtocolWriteHalf::send(
            &mut channel.tx,
            TrackerMessage::PeerConnect {
                user_id: participant_id,
            },
        )
        .await
        {
            bail!(ConnectionError(format!("hello to {} failed: {e}", self.addr)));
        }
        log::info!("connected to tracker {} as participant {participant_id}", self.addr);
        Ok(channel)
    }
}

/// Capped exponential backoff: `base * 2^n` until `cap`, given up after `max_attempts`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Backoff {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt, or None if attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(
            DEFAULT_BACKOFF_BASE,
            DEFAULT_BACKOFF_CAP,
            DEFAULT_BACKOFF_MAX_ATTEMPTS,
        )
    }
}

/// Retries `connector` following `backoff`. `on_attempt(attempt, delay)` is called before each
/// wait. Fails with `ConnectionError` once the attempts are exhausted.
pub async fn reconnect<C: TrackerConnector, F: FnMut(u32, Duration)>(
    connector: &C,
    participant_id: ParticipantId,
    mut backoff: Backoff,
    mut on_attempt: F,
) -> Result<FrameChannel> {
    let mut last_error = String::from("no attempt made");
    while let Some(delay) = backoff.next_delay() {
        let attempt = backoff.attempt();
        log::warn!("tracker reconnect attempt {attempt} in {delay:?}");
        on_attempt(attempt, delay);
        sleep(delay).await;
        match connector.connect(participant_id).await {
            Ok(channel) => return Ok(channel),
            Err(e) => {
                log::warn!("tracker reconnect attempt {attempt} failed: {e}");
                last_error = e.to_string();
            }
        }
    }
    bail!(ConnectionError(format!(
        "giving up after {} attempts, last error: {last_error}",
        backoff.attempt()
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::wire_protocol::ProtocolReadHalf;

    #[test]
    fn backoff_doubles_then_caps_then_gives_up() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10]);
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    struct FailingConnector {
        calls: Arc<AtomicU32>,
        succeed_on: Option<u32>,
    }

    impl TrackerConnector for FailingConnector {
        async fn connect(&self, _participant_id: ParticipantId) -> Result<FrameChannel> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(call) == self.succeed_on {
                let (ours, _theirs) = FrameChannel::pair(1);
                return Ok(ours);
            }
            bail!(ConnectionError("refused".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_is_abandoned_after_five_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = FailingConnector {
            calls: calls.clone(),
            succeed_on: None,
        };
        let mut seen = Vec::new();
        let err = reconnect(&connector, 1, Backoff::default(), |attempt, delay| {
            seen.push((attempt, delay.as_secs()))
        })
        .await
        .unwrap_err();

        assert_matches!(err.downcast_ref::<ConnectionError>(), Some(_));
        assert_eq!(seen, vec![(1, 1), (2, 2), (3, 4), (4, 8), (5, 10)]);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_stops_at_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = FailingConnector {
            calls: calls.clone(),
            succeed_on: Some(3),
        };
        let mut attempts = 0;
        reconnect(&connector, 1, Backoff::default(), |_, _| attempts += 1)
            .await
            .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn tcp_connector_sends_hello() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = tcp_frames::bridge(stream, "test tracker".to_string());
            let hello: TrackerMessage = channel.rx.receive().await.unwrap();
            hello
        });

        let connector = TcpTrackerConnector::new(addr.to_string(), DEFAULT_CONNECT_TIMEOUT);
        let _channel = connector.connect(77).await.unwrap();
        assert_eq!(
            server.await.unwrap(),
            TrackerMessage::PeerConnect { user_id: 77 }
        );
    }

    #[tokio::test]
    async fn tcp_connector_reports_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let connector = TcpTrackerConnector::new(addr.to_string(), DEFAULT_CONNECT_TIMEOUT);
        let err = connector.connect(1).await.unwrap_err();
        assert_matches!(err.downcast_ref::<ConnectionError>(), Some(_));
    }
}
