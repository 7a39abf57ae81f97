//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing split reader/writer
//! halves. Request building is separate from the handshake so that a
//! malformed endpoint is rejected synchronously, before any task is spawned.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Close frame with status code and reason.
    Close { code: u16, reason: String },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send failed")
    }

    /// Send a close frame and flush the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Ping, pong and raw frames are skipped; tungstenite answers pings itself.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Some(Err(anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Build the handshake request for `uri`.
pub fn prepare(uri: &str) -> Result<Request> {
    uri.into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {uri}"))
}

/// Perform the WebSocket handshake, bounded by `timeout` when given.
pub async fn open(request: Request, timeout: Option<Duration>) -> Result<(WsWriter, WsReader)> {
    let handshake = tokio_tungstenite::connect_async(request);

    let (ws_stream, _response) = match timeout {
        Some(limit) => tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| {
                anyhow!(
                    "connection attempt timed out after {}s",
                    limit.as_secs_f64()
                )
            })?,
        None => handshake.await,
    }
    .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}
