//! Keep-alive message loop over an established session
//!
//! A sender task writes a random alphabetic string every period while the
//! receiver reads chunks and logs them. Any read or write failure ends the
//! loop with [`NetworkError::ConnectionRuntime`]; nothing is retried.

use std::io;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::agent::SessionStream;
use super::config::MessageLoopConfig;
use super::error::NetworkError;

/// Characters a payload is drawn from
const PAYLOAD_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Observable activity of the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    Sent(String),
    Received(String),
}

/// Generate a random alphabetic payload from the OS RNG
pub fn random_payload(len: usize) -> String {
    (0..len)
        .map(|_| PAYLOAD_ALPHABET[OsRng.gen_range(0..PAYLOAD_ALPHABET.len())] as char)
        .collect()
}

/// Sender and receiver over one session
pub struct MessageLoop {
    session: Arc<dyn SessionStream>,
    config: MessageLoopConfig,
    observer: Option<mpsc::UnboundedSender<LoopEvent>>,
}

impl MessageLoop {
    pub fn new(session: Arc<dyn SessionStream>, config: MessageLoopConfig) -> Self {
        Self {
            session,
            config,
            observer: None,
        }
    }

    /// Report every sent and received payload on `observer`
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run until the session fails or `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<(), NetworkError> {
        let mut sender = tokio::spawn(send_loop(
            self.session.clone(),
            self.config.clone(),
            self.observer.clone(),
        ));

        let result = tokio::select! {
            sent = &mut sender => match sent {
                Ok(result) => result,
                Err(e) => Err(NetworkError::ConnectionRuntime(io::Error::new(
                    io::ErrorKind::Other,
                    format!("sender task ended: {}", e),
                ))),
            },
            received = receive_loop(self.session.clone(), self.config.read_buffer, self.observer.clone()) => received,
            _ = cancel.cancelled() => {
                debug!("Message loop cancelled");
                Ok(())
            }
        };

        sender.abort();
        result
    }
}

async fn send_loop(
    session: Arc<dyn SessionStream>,
    config: MessageLoopConfig,
    observer: Option<mpsc::UnboundedSender<LoopEvent>>,
) -> Result<(), NetworkError> {
    // First message goes out one full period after establishment
    let mut ticker = interval_at(Instant::now() + config.period, config.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let val = random_payload(config.payload_len);
        session
            .write(val.as_bytes())
            .await
            .map_err(NetworkError::ConnectionRuntime)?;

        info!("Sent: '{}'", val);
        if let Some(observer) = &observer {
            let _ = observer.send(LoopEvent::Sent(val));
        }
    }
}

/// Read chunks until the session fails
///
/// The session carries datagrams, so a zero-length read is an empty message
/// and is reported like any other; only a read error ends the loop.
async fn receive_loop(
    session: Arc<dyn SessionStream>,
    read_buffer: usize,
    observer: Option<mpsc::UnboundedSender<LoopEvent>>,
) -> Result<(), NetworkError> {
    let mut buf = vec![0u8; read_buffer];

    loop {
        let n = session
            .read(&mut buf)
            .await
            .map_err(NetworkError::ConnectionRuntime)?;

        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        info!("Received: '{}'", text);
        if let Some(observer) = &observer {
            let _ = observer.send(LoopEvent::Received(text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// In-memory session: writes land in `written`, reads come from `inbound`
    struct MemorySession {
        inbound: Mutex<mpsc::Receiver<io::Result<Vec<u8>>>>,
        written: mpsc::UnboundedSender<Vec<u8>>,
        fail_writes: bool,
    }

    #[async_trait]
    impl SessionStream for MemorySession {
        async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inbound.lock().await.recv().await {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "inbound closed")),
            }
        }

        async fn write(&self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
            }
            let _ = self.written.send(buf.to_vec());
            Ok(buf.len())
        }

        async fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn memory_session(
        fail_writes: bool,
    ) -> (
        Arc<MemorySession>,
        mpsc::Sender<io::Result<Vec<u8>>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = Arc::new(MemorySession {
            inbound: Mutex::new(in_rx),
            written: out_tx,
            fail_writes,
        });
        (session, in_tx, out_rx)
    }

    fn fast_config() -> MessageLoopConfig {
        MessageLoopConfig {
            period: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn test_random_payload_is_alphabetic() {
        let payload = random_payload(15);
        assert_eq!(payload.len(), 15);
        assert!(payload.chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(payload, random_payload(15));
    }

    #[tokio::test]
    async fn test_sender_writes_periodically() {
        let (session, _in_tx, mut written) = memory_session(false);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(MessageLoop::new(session, fast_config()).run(cancel.clone()));

        let first = written.recv().await.unwrap();
        let second = written.recv().await.unwrap();
        assert_eq!(first.len(), 15);
        assert_eq!(second.len(), 15);
        assert_ne!(first, second);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_receiver_reports_chunks() {
        let (session, in_tx, _written) = memory_session(false);
        let (obs_tx, mut obs_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            MessageLoop::new(session, MessageLoopConfig::default())
                .with_observer(obs_tx)
                .run(cancel.clone()),
        );

        in_tx.send(Ok(b"HelloFromPeer".to_vec())).await.unwrap();
        assert_eq!(
            obs_rx.recv().await,
            Some(LoopEvent::Received("HelloFromPeer".to_string()))
        );

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_empty_datagram_is_reported() {
        let (session, in_tx, _written) = memory_session(false);
        let (obs_tx, mut obs_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            MessageLoop::new(session, MessageLoopConfig::default())
                .with_observer(obs_tx)
                .run(cancel.clone()),
        );

        in_tx.send(Ok(Vec::new())).await.unwrap();
        in_tx.send(Ok(b"AfterEmpty".to_vec())).await.unwrap();
        assert_eq!(obs_rx.recv().await, Some(LoopEvent::Received(String::new())));
        assert_eq!(
            obs_rx.recv().await,
            Some(LoopEvent::Received("AfterEmpty".to_string()))
        );

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_read_error_is_fatal() {
        let (session, in_tx, _written) = memory_session(false);
        let handle = tokio::spawn(
            MessageLoop::new(session, MessageLoopConfig::default()).run(CancellationToken::new()),
        );

        in_tx
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(NetworkError::ConnectionRuntime(_))));
    }

    #[tokio::test]
    async fn test_write_error_is_fatal() {
        let (session, _in_tx, _written) = memory_session(true);
        let result = MessageLoop::new(session, fast_config())
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(NetworkError::ConnectionRuntime(_))));
    }
}
