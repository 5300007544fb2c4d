//! Consensus RPC transport over the stream layer.
//!
//! Frames are `[u32 BE length][bincode RaftMessage]`. Outbound requests
//! reuse one pooled connection per peer; a failed exchange drops the
//! connection and the next request redials.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::consensus::message::RaftMessage;
use crate::consensus::node::RaftEvent;
use crate::error::RpcError;
use crate::stream_layer::StreamLayer;

const MAX_FRAME_LEN: u64 = 32 * 1024 * 1024;
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), RpcError> {
    if payload.len() as u64 > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(payload.len() as u64));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, RpcError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as u64;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

type ConnSlot = Arc<tokio::sync::Mutex<Option<TcpStream>>>;

/// Outbound RPC client shared by the node's replication tasks.
#[derive(Clone, Default)]
pub struct Transport {
    slots: Arc<parking_lot::Mutex<HashMap<String, ConnSlot>>>,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends one request and awaits its response on the peer's pooled
    /// connection. Any failure drops the connection.
    pub async fn request(&self, addr: &str, msg: &RaftMessage) -> Result<RaftMessage, RpcError> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(addr.to_string()).or_default())
        };
        let mut conn = slot.lock().await;
        match tokio::time::timeout(REQUEST_TIMEOUT, exchange(&mut conn, addr, msg)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                *conn = None;
                Err(e)
            }
            Err(_) => {
                *conn = None;
                Err(RpcError::Timeout)
            }
        }
    }
}

async fn exchange(
    conn: &mut Option<TcpStream>,
    addr: &str,
    msg: &RaftMessage,
) -> Result<RaftMessage, RpcError> {
    if conn.is_none() {
        *conn = Some(StreamLayer::dial(addr, DIAL_TIMEOUT).await?);
    }
    let Some(stream) = conn.as_mut() else {
        return Err(RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "connection unavailable",
        )));
    };
    let payload = bincode::encode_to_vec(msg, bincode::config::standard())?;
    write_frame(stream, &payload).await?;
    let response = read_frame(stream).await?;
    let (resp, _) = bincode::decode_from_slice(&response, bincode::config::standard())?;
    Ok(resp)
}

/// Serves one inbound peer connection: decode a request, hand it to the
/// node driver, write the response back. Requests on a connection are
/// strictly serial.
pub(crate) async fn serve_peer(
    mut stream: TcpStream,
    events: mpsc::UnboundedSender<RaftEvent>,
) {
    loop {
        let payload = match read_frame(&mut stream).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!("peer connection closed: {}", e);
                return;
            }
        };
        let msg = match bincode::decode_from_slice(&payload, bincode::config::standard()) {
            Ok((msg, _)) => msg,
            Err(e) => {
                warn!("dropping undecodable peer frame: {}", e);
                return;
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if events
            .send(RaftEvent::Rpc {
                msg,
                reply: reply_tx,
            })
            .is_err()
        {
            return;
        }
        let resp = match reply_rx.await {
            Ok(resp) => resp,
            Err(_) => return,
        };
        let payload = match bincode::encode_to_vec(&resp, bincode::config::standard()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode rpc response: {}", e);
                return;
            }
        };
        if let Err(e) = write_frame(&mut stream, &payload).await {
            debug!("peer connection closed while replying: {}", e);
            return;
        }
    }
}
