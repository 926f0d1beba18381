//! Connection Handler
//!
//! Per-connection control flow: classify the first bytes, answer plain HTTP
//! from the static root, or upgrade to WebSocket, register with the client
//! registry and run the receive loop until either side closes.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use super::error::ConnectionError;
use super::state::AppState;
use super::wait_for_shutdown;
use crate::http::{self, status_response, StatusCode};
use crate::websocket::{
    frame, handshake, is_upgrade_request, outbound_queue, ClientHandle, ConnectionId,
    HandshakeRequest, Opcode, OutboundFrame, ProtocolError,
};

/// How long the writer may take to flush queued frames after the handler exits
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest a single response or frame write may wait on a peer that is not reading
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingClassification,
    HandshakeInProgress,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::AwaitingClassification => "awaiting_classification",
            ConnectionState::HandshakeInProgress => "handshake",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Serve one accepted TCP connection to completion
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    let buffer_size = state.config.server.buffer_size;
    let mut conn_state = ConnectionState::AwaitingClassification;

    let initial = tokio::select! {
        head = read_request_head(&mut stream, buffer_size) => head?,
        _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
    };
    if initial.is_empty() {
        tracing::trace!(peer = %peer, "Connection closed before sending data");
        return Ok(());
    }

    if !is_upgrade_request(&initial) {
        match answer_http(&mut stream, &initial, &state, WRITE_TIMEOUT).await {
            Ok(status) => {
                tracing::debug!(peer = %peer, status = status.code(), "HTTP request served");
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                tracing::debug!(peer = %peer, "HTTP response timed out");
            }
            Err(e) => return Err(e.into()),
        }
        let _ = stream.shutdown().await;
        return Ok(());
    }

    conn_state = transition(conn_state, ConnectionState::HandshakeInProgress, &peer);
    let request = match HandshakeRequest::parse(&initial) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "Rejected WebSocket handshake");
            reject(&mut stream, StatusCode::BadRequest, WRITE_TIMEOUT).await;
            return Err(e.into());
        }
    };

    let (tx, rx) = outbound_queue();
    let handle = ClientHandle::new(tx, request.token.clone());
    let id = handle.id().to_string();

    if let Err(e) = state.registry.register(handle.clone()).await {
        tracing::warn!(peer = %peer, error = %e, "Rejecting WebSocket client");
        reject(&mut stream, StatusCode::ServiceUnavailable, WRITE_TIMEOUT).await;
        return Ok(());
    }

    let response = handshake::switching_protocols_response(&request.accept_key());
    if let Err(e) = write_bounded(&mut stream, response.as_bytes(), WRITE_TIMEOUT).await {
        state.registry.unregister(&id).await;
        return Err(e.into());
    }

    conn_state = transition(conn_state, ConnectionState::Open, &peer);
    tracing::info!(
        connection_id = %id,
        peer = %peer,
        path = %request.path,
        "WebSocket connection established"
    );

    let (mut reader, writer) = stream.into_split();
    let mut writer_task = tokio::spawn(write_frames(writer, rx, id.clone(), WRITE_TIMEOUT));

    match state.dispatcher.initial_frame().await {
        Ok(frame) => {
            let _ = handle.send(frame);
        }
        Err(e) => tracing::error!(connection_id = %id, error = %e, "Failed to encode initial snapshot"),
    }

    // Bytes that followed the request head
    let mut pending = leftover_after_head(&initial);
    let mut chunk = vec![0u8; buffer_size];

    let result: Result<(), ConnectionError> = loop {
        match drain_frames(&mut pending, buffer_size, &id) {
            Ok(true) => {
                tracing::debug!(connection_id = %id, "Client sent close frame");
                break Ok(());
            }
            Ok(false) => {}
            Err(e) => break Err(e.into()),
        }

        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                tracing::debug!(connection_id = %id, "Closing connection for shutdown");
                break Ok(());
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => pending.extend_from_slice(&chunk[..n]),
                Err(e) => break Err(e.into()),
            },
        }
    };

    transition(conn_state, ConnectionState::Closing, &peer);
    state.registry.unregister(&id).await;

    let _ = handle.send(OutboundFrame::from(frame::close_frame()));
    drop(handle);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        tracing::warn!(connection_id = %id, "Writer did not finish in time");
        writer_task.abort();
    }

    match &result {
        Ok(()) => tracing::info!(connection_id = %id, "WebSocket connection closed"),
        Err(e) => tracing::info!(connection_id = %id, error = %e, "WebSocket connection closed with error"),
    }
    result
}

fn transition(from: ConnectionState, to: ConnectionState, peer: &SocketAddr) -> ConnectionState {
    tracing::trace!(peer = %peer, from = %from, to = %to, "Connection state change");
    to
}

/// Read until the end of the request head, EOF, or `limit` bytes
async fn read_request_head<R>(reader: &mut R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(limit);
    let mut chunk = vec![0u8; limit];

    while head.len() < limit {
        let n = reader.read(&mut chunk[..limit - head.len()]).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        if head_end(&head).is_some() {
            break;
        }
    }
    Ok(head)
}

/// Offset just past the blank line ending the request head
fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn leftover_after_head(initial: &[u8]) -> Vec<u8> {
    head_end(initial)
        .map(|end| initial[end..].to_vec())
        .unwrap_or_default()
}

/// Decode every complete frame in `pending`
///
/// Consumed bytes are removed. Returns `true` once a close frame is seen.
fn drain_frames(pending: &mut Vec<u8>, limit: usize, id: &str) -> Result<bool, ProtocolError> {
    let mut offset = 0;

    let result = loop {
        if offset == pending.len() {
            break Ok(false);
        }

        match frame::decode(&pending[offset..]) {
            Ok((inbound, used)) => {
                offset += used;
                if used > limit {
                    break Err(ProtocolError::FrameTooLarge { size: used, limit });
                }
                if !inbound.masked {
                    break Err(ProtocolError::UnmaskedFrame);
                }

                match inbound.opcode {
                    Opcode::Close => break Ok(true),
                    Opcode::Text => {
                        tracing::debug!(connection_id = %id, message = %inbound.text(), "Ignoring client text frame");
                    }
                    _ => {
                        tracing::debug!(
                            connection_id = %id,
                            opcode = inbound.opcode.as_u8(),
                            len = inbound.payload.len(),
                            "Ignoring client frame"
                        );
                    }
                }
            }
            Err(ProtocolError::TruncatedFrame { needed, .. }) if needed > limit => {
                break Err(ProtocolError::FrameTooLarge {
                    size: needed,
                    limit,
                });
            }
            Err(ProtocolError::TruncatedFrame { .. }) => break Ok(false),
            Err(e) => break Err(e),
        }
    };

    pending.drain(..offset);
    result
}

/// Write `bytes`, giving up once the peer has not accepted them within `limit`
async fn write_bounded<W>(writer: &mut W, bytes: &[u8], limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(limit, writer.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}

/// Serve a plain HTTP request from the static root within `limit`
async fn answer_http<W>(
    writer: &mut W,
    initial: &[u8],
    state: &AppState,
    limit: Duration,
) -> io::Result<StatusCode>
where
    W: AsyncWrite + Unpin,
{
    let served = http::serve_static(
        writer,
        initial,
        &state.config.server.www_root,
        &state.tokens,
    );
    match tokio::time::timeout(limit, served).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "response timed out")),
    }
}

/// Drain the connection's queue onto the socket
///
/// Stops after a close frame, the first write error, or a write the peer
/// leaves pending for `limit`, then shuts the write side down. Once this
/// returns the queue is dropped, so further sends to the handle fail.
async fn write_frames<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<OutboundFrame>,
    id: ConnectionId,
    limit: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        if let Err(e) = write_bounded(&mut writer, &outbound, limit).await {
            tracing::debug!(connection_id = %id, error = %e, "WebSocket write failed");
            break;
        }
        if is_close(&outbound) {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn is_close(encoded: &[u8]) -> bool {
    encoded
        .first()
        .map(|b| b & 0x0F == Opcode::Close.as_u8())
        .unwrap_or(false)
}

async fn reject<W>(stream: &mut W, status: StatusCode, limit: Duration)
where
    W: AsyncWrite + Unpin,
{
    let _ = write_bounded(stream, status_response(status).as_bytes(), limit).await;
    let _ = tokio::time::timeout(limit, stream.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    #[test]
    fn test_head_end_and_leftover() {
        let request = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n\x88\x80";
        assert_eq!(head_end(request), Some(request.len() - 2));
        assert_eq!(leftover_after_head(request), vec![0x88, 0x80]);
        assert_eq!(head_end(b"GET / HTTP/1.1\r\n"), None);
        assert!(leftover_after_head(b"GET / HTTP/1.1\r\n").is_empty());
    }

    #[tokio::test]
    async fn test_read_request_head_stops_at_blank_line() {
        let data: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut reader = data;
        let head = read_request_head(&mut reader, 1024).await.unwrap();
        assert_eq!(head, data);

        let mut reader: &[u8] = b"0123456789";
        let head = read_request_head(&mut reader, 4).await.unwrap();
        assert_eq!(head, b"0123");
    }

    #[test]
    fn test_drain_frames_handles_partial_and_multiple() {
        let mut pending = frame::encode_masked(Opcode::Text, b"one", KEY);
        pending.extend(frame::encode_masked(Opcode::Text, b"two", KEY));
        let close = frame::encode_masked(Opcode::Close, &[], KEY);
        pending.extend_from_slice(&close[..1]);

        assert_eq!(drain_frames(&mut pending, 1024, "c"), Ok(false));
        assert_eq!(pending, vec![close[0]]);

        pending.extend_from_slice(&close[1..]);
        assert_eq!(drain_frames(&mut pending, 1024, "c"), Ok(true));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_drain_frames_rejects_unmasked() {
        let mut pending = frame::encode(Opcode::Text, b"hi");
        assert_eq!(
            drain_frames(&mut pending, 1024, "c"),
            Err(ProtocolError::UnmaskedFrame)
        );
    }

    #[test]
    fn test_drain_frames_rejects_oversized() {
        let full = frame::encode_masked(Opcode::Text, &[b'x'; 300], KEY);

        let mut partial = full[..100].to_vec();
        assert!(matches!(
            drain_frames(&mut partial, 128, "c"),
            Err(ProtocolError::FrameTooLarge { limit: 128, .. })
        ));

        let mut whole = full.clone();
        assert!(matches!(
            drain_frames(&mut whole, 128, "c"),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_writer_gives_up_on_stalled_peer() {
        // The peer half is kept open but never read
        let (local, _peer) = tokio::io::duplex(16);
        let (tx, rx) = outbound_queue();
        let handle = ClientHandle::new(tx, None);

        let writer = tokio::spawn(write_frames(
            local,
            rx,
            handle.id().to_string(),
            Duration::from_millis(50),
        ));
        handle
            .send(OutboundFrame::from(frame::encode(Opcode::Text, &[b'x'; 256])))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer should stop")
            .unwrap();

        // The queue is gone, so the next broadcast drops this client
        assert!(handle
            .send(OutboundFrame::from(frame::close_frame()))
            .is_err());
    }

    #[tokio::test]
    async fn test_writer_delivers_until_close() {
        let (local, mut peer) = tokio::io::duplex(1024);
        let (tx, rx) = outbound_queue();
        let text = frame::encode(Opcode::Text, b"{}");
        tx.try_send(OutboundFrame::from(text.clone())).unwrap();
        tx.try_send(OutboundFrame::from(frame::close_frame())).unwrap();

        write_frames(local, rx, "c".to_string(), Duration::from_secs(1)).await;

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        let mut expected = text;
        expected.extend(frame::close_frame());
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_reject_does_not_hang_on_stalled_peer() {
        let (mut local, _peer) = tokio::io::duplex(8);
        tokio::time::timeout(
            Duration::from_secs(5),
            reject(&mut local, StatusCode::ServiceUnavailable, Duration::from_millis(50)),
        )
        .await
        .expect("reject should give up");
    }

    #[tokio::test]
    async fn test_static_response_times_out_on_stalled_peer() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("index.html"), vec![b'a'; 8192]).unwrap();
        let mut config = crate::config::Config::default();
        config.server.www_root = root.path().to_path_buf();
        let state = AppState::new(config);

        let (mut local, _peer) = tokio::io::duplex(64);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            answer_http(
                &mut local,
                b"GET / HTTP/1.1\r\n\r\n",
                &state,
                Duration::from_millis(50),
            ),
        )
        .await
        .expect("static response should give up");
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);

        // A peer that reads gets the page
        let (mut local, mut peer) = tokio::io::duplex(64);
        let reader = tokio::spawn(async move {
            let mut body = Vec::new();
            peer.read_to_end(&mut body).await.unwrap();
            body
        });
        let status = answer_http(
            &mut local,
            b"GET / HTTP/1.1\r\n\r\n",
            &state,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        drop(local);
        assert_eq!(status, StatusCode::Ok);
        assert!(reader.await.unwrap().ends_with(&[b'a'; 16]));
    }

    #[test]
    fn test_is_close() {
        assert!(is_close(&frame::close_frame()));
        assert!(!is_close(&frame::encode(Opcode::Text, b"{}")));
        assert!(!is_close(&[]));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(
            transition(
                ConnectionState::Open,
                ConnectionState::Closing,
                &"127.0.0.1:1".parse().unwrap()
            ),
            ConnectionState::Closing
        );
    }
}
