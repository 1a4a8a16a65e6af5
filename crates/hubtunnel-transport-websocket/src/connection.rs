//! WebSocket connection with a decoupled receive pipeline

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hubtunnel_proto::{CodecError, TunnelCodec, TunnelMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig as WsProtocolConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::{ensure_crypto_provider, WebSocketConfig};
use crate::{TransportError, TransportResult};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Close handshake, initiated by either side
    NormalClosure,
    /// Local shutdown without a completed close handshake
    Cancelled,
    /// Transport error while reading
    ClosedWithException,
    /// The peer sent a non-binary data frame
    ClosedWithInvalidMessageType,
    /// The byte stream could not be decoded
    DecodeError,
}

/// Events produced by a connection's receive pipeline.
///
/// Every connection yields any number of `Message` events followed by exactly
/// one `Disconnected` event.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message(TunnelMessage),
    Disconnected {
        reason: DisconnectReason,
        error: Option<String>,
    },
}

/// Connection counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_received: u64,
    pub uptime_secs: u64,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
}

struct PipelineTasks {
    reader: JoinHandle<()>,
    parser: JoinHandle<()>,
}

type ReaderOutcome = (DisconnectReason, Option<String>);

/// One physical WebSocket connection to the tunnel service
pub struct WebSocketConnection {
    /// Connection ID for logging
    connection_id: String,
    endpoint: Url,
    /// Writers take this lock for one complete frame at a time
    sink: Arc<Mutex<WsSink>>,
    /// Cancels the receive pipeline
    shutdown: CancellationToken,
    tasks: Mutex<Option<PipelineTasks>>,
    close_timeout: Duration,
    created_at: Instant,
    counters: Arc<Counters>,
    /// Set once a close has been initiated locally
    closing: AtomicBool,
    /// Set once the receive pipeline has finished
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("connection_id", &self.connection_id)
            .field("endpoint", &self.endpoint.as_str())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WebSocketConnection {
    /// Open a connection to `endpoint`, authenticating with `bearer_token`.
    ///
    /// Fails without retrying. `cancel` aborts an in-flight connect.
    pub async fn connect(
        endpoint: &Url,
        bearer_token: &str,
        config: &WebSocketConfig,
        cancel: &CancellationToken,
    ) -> TransportResult<(Self, mpsc::Receiver<ConnectionEvent>)> {
        config.validate()?;
        ensure_crypto_provider();

        let mut request = endpoint.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", bearer_token)).map_err(|_| {
            TransportError::AuthenticationFailed("Bearer token is not a valid header value".into())
        })?;
        request.headers_mut().insert(AUTHORIZATION, auth);
        if let Ok(agent) = HeaderValue::from_str(&config.user_agent) {
            request.headers_mut().insert(USER_AGENT, agent);
        }

        let mut ws_config = WsProtocolConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);

        let connect = tokio_tungstenite::connect_async_with_config(request, Some(ws_config), true);
        let (ws_stream, _response) = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = tokio::time::timeout(config.connect_timeout, connect) => {
                match result {
                    Err(_) => return Err(TransportError::Timeout),
                    Ok(Err(tungstenite::Error::Http(response)))
                        if matches!(
                            response.status(),
                            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                        ) =>
                    {
                        return Err(TransportError::AuthenticationFailed(format!(
                            "Service rejected the upgrade with {}",
                            response.status()
                        )));
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(connected)) => connected,
                }
            }
        };

        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
        info!("[{}] Connected to {}", connection_id, endpoint);

        let (ws_sink, ws_source) = ws_stream.split();
        let sink = Arc::new(Mutex::new(ws_sink));
        // Independent of `cancel`, which only bounds the connect
        let shutdown = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let closed = Arc::new(AtomicBool::new(false));

        let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(config.read_buffer_chunks);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        // Spawn reader task
        let reader = tokio::spawn(reader_task(
            ws_source,
            sink.clone(),
            chunk_tx,
            outcome_tx,
            shutdown.clone(),
            counters.clone(),
            connection_id.clone(),
        ));

        // Spawn parser task
        let parser = tokio::spawn(parser_task(
            chunk_rx,
            outcome_rx,
            event_tx,
            shutdown.clone(),
            counters.clone(),
            closed.clone(),
            connection_id.clone(),
        ));

        let conn = Self {
            connection_id,
            endpoint: endpoint.clone(),
            sink,
            shutdown,
            tasks: Mutex::new(Some(PipelineTasks { reader, parser })),
            close_timeout: config.close_timeout,
            created_at: Instant::now(),
            counters,
            closing: AtomicBool::new(false),
            closed,
        };

        Ok((conn, event_rx))
    }

    /// Write one complete binary frame
    pub async fn send(&self, frame: Bytes) -> TransportResult<()> {
        if self.closing.load(Ordering::SeqCst) || self.is_closed() {
            return Err(TransportError::Closed);
        }

        let len = frame.len() as u64;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(frame.to_vec())).await?;
        drop(sink);

        self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
        trace!("[{}] Sent frame of {} bytes", self.connection_id, len);
        Ok(())
    }

    /// Encode and send a tunnel message
    pub async fn send_message(&self, message: &TunnelMessage) -> TransportResult<()> {
        let frame = TunnelCodec::encode(message)?;
        self.send(frame).await
    }

    /// Close gracefully and wait for the receive pipeline to drain.
    ///
    /// Sends a close frame, waits up to the configured close timeout for the
    /// peer to finish the handshake, then cancels whatever is left. When this
    /// returns no background task of this connection is running. Safe to call
    /// more than once and from several tasks.
    pub async fn stop(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) && !self.is_closed() {
            debug!("[{}] Closing connection", self.connection_id);
            let close = async {
                let mut sink = self.sink.lock().await;
                sink.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: Cow::Borrowed(""),
                })))
                .await
            };
            match tokio::time::timeout(self.close_timeout, close).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("[{}] Close frame not sent: {}", self.connection_id, e),
                Err(_) => debug!("[{}] Timed out sending close frame", self.connection_id),
            }
        }

        let mut tasks = self.tasks.lock().await;
        let Some(mut pipeline) = tasks.take() else {
            return;
        };

        if tokio::time::timeout(self.close_timeout, &mut pipeline.parser)
            .await
            .is_err()
        {
            debug!(
                "[{}] Close handshake not completed in {:?}, cancelling",
                self.connection_id, self.close_timeout
            );
            self.shutdown.cancel();
            if tokio::time::timeout(self.close_timeout, &mut pipeline.parser)
                .await
                .is_err()
            {
                // Nobody is draining events
                warn!("[{}] Event consumer stalled, aborting parser", self.connection_id);
                pipeline.parser.abort();
                let _ = (&mut pipeline.parser).await;
                self.closed.store(true, Ordering::SeqCst);
            }
        }
        self.shutdown.cancel();
        let _ = pipeline.reader.await;
        debug!("[{}] Connection stopped", self.connection_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Reader task - moves raw binary payloads from the socket into the chunk channel
async fn reader_task(
    mut source: WsSource,
    sink: Arc<Mutex<WsSink>>,
    chunks: mpsc::Sender<Bytes>,
    outcome: oneshot::Sender<ReaderOutcome>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
    conn_id: String,
) {
    let result: ReaderOutcome = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break (DisconnectReason::Cancelled, None),
            next = source.next() => next,
        };

        match next {
            Some(Ok(Message::Binary(data))) => {
                counters
                    .bytes_received
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                trace!("[{}] Received {} bytes", conn_id, data.len());

                tokio::select! {
                    _ = shutdown.cancelled() => break (DisconnectReason::Cancelled, None),
                    sent = chunks.send(Bytes::from(data)) => {
                        if sent.is_err() {
                            // Parser is gone, it already decided how this ends
                            break (DisconnectReason::Cancelled, None);
                        }
                    }
                }
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                // Pong is automatically handled by tungstenite
                trace!("[{}] Received ping/pong", conn_id);
            }
            Some(Ok(Message::Close(frame))) => {
                debug!("[{}] WebSocket close received: {:?}", conn_id, frame);
                // Finish the handshake if we did not start it
                let _ = sink.lock().await.close().await;
                break (DisconnectReason::NormalClosure, None);
            }
            Some(Ok(Message::Text(_))) => {
                error!("[{}] Received text frame, only binary is supported", conn_id);
                break (
                    DisconnectReason::ClosedWithInvalidMessageType,
                    Some("text frame received".to_string()),
                );
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
                debug!("[{}] WebSocket stream ended", conn_id);
                break (DisconnectReason::NormalClosure, None);
            }
            Some(Err(e)) => {
                warn!("[{}] WebSocket read error: {}", conn_id, e);
                break (DisconnectReason::ClosedWithException, Some(e.to_string()));
            }
        }
    };

    debug!("[{}] WebSocket reader task ended: {:?}", conn_id, result.0);
    let _ = outcome.send(result);
}

enum ParseStop {
    Decode(CodecError),
    Cancelled,
}

/// Parser task - buffers chunks, decodes frames and emits events
async fn parser_task(
    mut chunks: mpsc::Receiver<Bytes>,
    reader_outcome: oneshot::Receiver<ReaderOutcome>,
    events: mpsc::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
    conn_id: String,
) {
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    let (reason, error) = loop {
        let Some(chunk) = chunks.recv().await else {
            // Reader finished; the outcome is sent before its chunk sender drops
            break reader_outcome
                .await
                .unwrap_or((DisconnectReason::Cancelled, None));
        };
        buffer.extend_from_slice(&chunk);

        match deliver_buffered(&mut buffer, &events, &shutdown, &counters).await {
            Ok(()) => {}
            Err(ParseStop::Decode(e)) => {
                error!("[{}] Failed to decode tunnel frame: {}", conn_id, e);
                shutdown.cancel();
                break (DisconnectReason::DecodeError, Some(e.to_string()));
            }
            Err(ParseStop::Cancelled) => {
                shutdown.cancel();
                break (DisconnectReason::Cancelled, None);
            }
        }
    };

    // Make sure the reader is gone before announcing the disconnect
    drop(chunks);
    if !buffer.is_empty() {
        debug!(
            "[{}] Discarding {} bytes of incomplete frame",
            conn_id,
            buffer.len()
        );
    }

    closed.store(true, Ordering::SeqCst);
    debug!("[{}] Disconnected: {:?} {:?}", conn_id, reason, error);
    let _ = events
        .send(ConnectionEvent::Disconnected { reason, error })
        .await;
}

async fn deliver_buffered(
    buffer: &mut BytesMut,
    events: &mpsc::Sender<ConnectionEvent>,
    shutdown: &CancellationToken,
    counters: &Counters,
) -> Result<(), ParseStop> {
    loop {
        let message = match TunnelCodec::try_parse(buffer) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(e) => return Err(ParseStop::Decode(e)),
        };
        counters.messages_received.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            _ = shutdown.cancelled() => return Err(ParseStop::Cancelled),
            sent = events.send(ConnectionEvent::Message(message)) => {
                if sent.is_err() {
                    return Err(ParseStop::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_is_copy() {
        let reason = DisconnectReason::DecodeError;
        let copied = reason;
        assert_eq!(reason, copied);
    }

    #[tokio::test]
    async fn test_parser_reports_decode_error_once() {
        let (chunk_tx, chunk_rx) = mpsc::channel(4);
        let (_outcome_tx, outcome_rx) = oneshot::channel();
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(parser_task(
            chunk_rx,
            outcome_rx,
            event_tx,
            shutdown.clone(),
            Arc::new(Counters::default()),
            closed.clone(),
            "test".to_string(),
        ));

        // array(1) [3] - unknown message type
        chunk_tx
            .send(Bytes::from_static(&[2, 0, 0, 0, 0x91, 0x03]))
            .await
            .unwrap();
        task.await.unwrap();

        match event_rx.recv().await {
            Some(ConnectionEvent::Disconnected { reason, error }) => {
                assert_eq!(reason, DisconnectReason::DecodeError);
                assert!(error.is_some());
            }
            other => panic!("Expected Disconnected, got {:?}", other),
        }
        assert!(event_rx.recv().await.is_none());
        assert!(shutdown.is_cancelled());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_parser_reassembles_split_frames() {
        use hubtunnel_proto::{CloseMessage, TunnelCodec};

        let (chunk_tx, chunk_rx) = mpsc::channel(4);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (event_tx, mut event_rx) = mpsc::channel(4);

        let task = tokio::spawn(parser_task(
            chunk_rx,
            outcome_rx,
            event_tx,
            CancellationToken::new(),
            Arc::new(Counters::default()),
            Arc::new(AtomicBool::new(false)),
            "test".to_string(),
        ));

        let message = TunnelMessage::Close(CloseMessage {
            message: "done".to_string(),
        });
        let encoded = TunnelCodec::encode(&message).unwrap();
        chunk_tx.send(encoded.slice(..3)).await.unwrap();
        chunk_tx.send(encoded.slice(3..)).await.unwrap();
        outcome_tx
            .send((DisconnectReason::NormalClosure, None))
            .unwrap();
        drop(chunk_tx);
        task.await.unwrap();

        match event_rx.recv().await {
            Some(ConnectionEvent::Message(m)) => assert_eq!(m, message),
            other => panic!("Expected Message, got {:?}", other),
        }
        assert!(matches!(
            event_rx.recv().await,
            Some(ConnectionEvent::Disconnected {
                reason: DisconnectReason::NormalClosure,
                ..
            })
        ));
    }
}
