//! Connection handling logic for WebSocket clients.
//!
//! This module drives one accepted TCP stream through the WebSocket upgrade,
//! the open connection, and its teardown, translating engine activity into
//! [`ServerCore`] callbacks.

use crate::connection::{rejection_response, ConnectionHandle, HandshakeRequest, Outbound};
use crate::error::HandshakeRejection;
use crate::policy::PROTOCOL_HEADER;
use crate::server::ServerCore;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::HeaderValue,
    protocol::{frame::coding::CloseCode, CloseFrame},
    Error as WsError, Message,
};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, trace, warn};

/// How long to wait for the peer once a close has been started.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

/// Echoes the negotiated subprotocol in the upgrade response.
///
/// A protocol that cannot be sent as a header value rejects the upgrade, so
/// `on_open` never reports a protocol the client did not receive.
fn echo_protocol(
    response: &mut Response,
    protocol: &str,
    requested: &[String],
) -> Result<(), HandshakeRejection> {
    let value = HeaderValue::from_str(protocol).map_err(|e| {
        warn!("⛔ Unusable subprotocol {:?}: {}", protocol, e);
        HandshakeRejection::ProtocolDenied {
            requested: requested.to_vec(),
        }
    })?;
    response.headers_mut().insert(PROTOCOL_HEADER, value);
    Ok(())
}

/// Handles a single client connection from upgrade to cleanup.
///
/// # Connection Flow
///
/// 1. Apply `TCP_NODELAY` if configured
/// 2. Run the upgrade, evaluating the handshake policy inside the callback
/// 3. Spawn a writer task draining the handle's outbound queue
/// 4. Register the connection (`on_open`)
/// 5. Read frames until the stream ends
/// 6. Report how the connection closed (`on_close`)
///
/// Rejected or failed upgrades never reach the core beyond `on_handshake`.
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, core: Arc<ServerCore>) {
    if core.config().tcp_no_delay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
    }

    let mut accepted: Option<(HandshakeRequest, Option<String>)> = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let handshake = HandshakeRequest::from_http(request);
        match core.on_handshake(&handshake) {
            Ok(protocol) => {
                if let Some(protocol) = &protocol {
                    echo_protocol(&mut response, protocol, &handshake.protocols)
                        .map_err(|rejection| rejection_response(&rejection))?;
                }
                accepted = Some((handshake, protocol));
                Ok(response)
            }
            Err(rejection) => Err(rejection_response(&rejection)),
        }
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            debug!("🚫 WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let Some((handshake, protocol)) = accepted else {
        debug!("Handshake with {} completed without policy evaluation", addr);
        return;
    };

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let (handle, outbound) = ConnectionHandle::new(addr);
    let mut writer = tokio::spawn(write_outbound(ws_sender, outbound, addr));

    if core
        .on_open(handle.clone(), &handshake, protocol.as_deref())
        .await
        .is_none()
    {
        finish_writer(&handle, &mut writer).await;
        return;
    }

    let mut peer_close: Option<(u16, String)> = None;
    // Read error text and any close the server had started before it
    let mut failure: Option<(String, Option<(u16, String)>)> = None;

    loop {
        let next = if handle.is_open() {
            ws_receiver.next().await
        } else {
            match tokio::time::timeout(CLOSE_TIMEOUT, ws_receiver.next()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!("⏱️ Connection {} did not finish closing in time", addr);
                    break;
                }
            }
        };

        let Some(frame) = next else { break };

        match frame {
            Ok(Message::Text(text)) => core.on_message(&handle, text.as_str().to_string()).await,
            Ok(Message::Close(frame)) => {
                debug!("🔌 Client {} sent close", addr);
                handle.mark_closed();
                if peer_close.is_none() {
                    peer_close = Some(match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_string()),
                        None => (u16::from(CloseCode::Status), String::new()),
                    });
                }
            }
            Ok(Message::Binary(data)) => {
                trace!("Ignoring {} byte binary frame from {}", data.len(), addr);
            }
            Ok(_) => {}
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
            Err(e) => {
                let reason = e.to_string();
                let started = handle.local_close();
                core.on_error(Some(&handle), Some(reason.clone())).await;
                failure = Some((reason, started));
                break;
            }
        }
    }

    handle.mark_closed();
    finish_writer(&handle, &mut writer).await;

    // A close forced by the read error itself does not count as a server close.
    let (local_close, error_text) = match failure {
        Some((text, started)) => (started, text),
        None => (handle.local_close(), String::new()),
    };

    let (code, reason, remote) = match (local_close, peer_close) {
        (Some((code, reason)), _) => (code, reason, false),
        (None, Some((code, reason))) => (code, reason, true),
        (None, None) => (u16::from(CloseCode::Abnormal), error_text, false),
    };

    core.on_close(&handle, code, reason, remote).await;
}

/// Drains queued frames onto the socket; stops after a close frame.
async fn write_outbound(
    mut ws_sender: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    addr: SocketAddr,
) {
    while let Some(item) = outbound.recv().await {
        let (message, last) = match item {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };

        if let Err(e) = ws_sender.send(message).await {
            debug!("Failed to write to {}: {}", addr, e);
            break;
        }
        if last {
            break;
        }
    }
}

/// Lets a pending close frame go out, then stops the writer.
async fn finish_writer(handle: &ConnectionHandle, writer: &mut JoinHandle<()>) {
    if handle.local_close().is_some() {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, &mut *writer).await;
    }
    writer.abort();
}
