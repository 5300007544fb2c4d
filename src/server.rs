//! Client-facing RPC server speaking a length-prefixed binary protocol
//! on the mux's client connections.
//!
//! TLS and authorization are layered outside the core; this server only
//! maps the replicated log's operations onto the wire.

use std::sync::Arc;
use std::time::Duration;

use bincode::{Decode, Encode};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::consensus::transport::{read_frame, write_frame};
use crate::distributed::{DistributedLog, ServerInfo};
use crate::error::{LogError, RaftError, RpcError};
use crate::record::Record;

/// How long a streaming consumer sleeps before retrying an offset that
/// is not written yet.
const CONSUME_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Encode, Decode)]
pub enum ClientRequest {
    Produce { value: Vec<u8> },
    Consume { offset: u64 },
    /// Streams records from `offset` onward until the client hangs up,
    /// waiting out offsets that are not written yet.
    ConsumeStream { offset: u64 },
    GetServers,
}

#[derive(Debug, Clone, Encode, Decode)]
pub enum ClientResponse {
    Produced { offset: u64 },
    Consumed { offset: u64, value: Vec<u8> },
    Servers { servers: Vec<ServerInfo> },
    Error { code: ErrorCode, message: String },
}

/// Offset-out-of-range gets its own code so stream consumers can retry
/// after a delay; everything else is internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ErrorCode {
    OffsetOutOfRange,
    NotLeader,
    Internal,
}

/// Accepts client connections from the mux and serves each on its own
/// task until the receiver closes.
pub async fn serve(log: Arc<DistributedLog>, mut conns: mpsc::Receiver<TcpStream>) {
    while let Some(stream) = conns.recv().await {
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, log).await {
                debug!("client connection ended: {}", e);
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    log: Arc<DistributedLog>,
) -> Result<(), RpcError> {
    loop {
        let payload = read_frame(&mut stream).await?;
        let (request, _) = bincode::decode_from_slice(&payload, bincode::config::standard())?;
        match request {
            ClientRequest::Produce { value } => {
                let response = match log.append(Record::new(value)).await {
                    Ok(offset) => ClientResponse::Produced { offset },
                    Err(e) => raft_error_response(e),
                };
                send(&mut stream, &response).await?;
            }
            ClientRequest::Consume { offset } => {
                let response = consume_one(&log, offset);
                send(&mut stream, &response).await?;
            }
            ClientRequest::ConsumeStream { mut offset } => loop {
                match log.read(offset) {
                    Ok(record) => {
                        send(
                            &mut stream,
                            &ClientResponse::Consumed {
                                offset: record.offset,
                                value: record.value,
                            },
                        )
                        .await?;
                        offset += 1;
                    }
                    Err(LogError::OffsetOutOfRange(_)) => {
                        tokio::time::sleep(CONSUME_RETRY).await;
                    }
                    Err(e) => {
                        send(&mut stream, &log_error_response(e)).await?;
                        return Ok(());
                    }
                }
            },
            ClientRequest::GetServers => {
                let response = match log.get_servers().await {
                    Ok(servers) => ClientResponse::Servers { servers },
                    Err(e) => raft_error_response(e),
                };
                send(&mut stream, &response).await?;
            }
        }
    }
}

fn consume_one(log: &DistributedLog, offset: u64) -> ClientResponse {
    match log.read(offset) {
        Ok(record) => ClientResponse::Consumed {
            offset: record.offset,
            value: record.value,
        },
        Err(e) => log_error_response(e),
    }
}

async fn send(stream: &mut TcpStream, response: &ClientResponse) -> Result<(), RpcError> {
    let payload = bincode::encode_to_vec(response, bincode::config::standard())?;
    write_frame(stream, &payload).await
}

fn log_error_response(err: LogError) -> ClientResponse {
    let code = match err {
        LogError::OffsetOutOfRange(_) => ErrorCode::OffsetOutOfRange,
        _ => ErrorCode::Internal,
    };
    ClientResponse::Error {
        code,
        message: err.to_string(),
    }
}

fn raft_error_response(err: RaftError) -> ClientResponse {
    let code = match &err {
        RaftError::NotLeader { .. } => ErrorCode::NotLeader,
        RaftError::Log(LogError::OffsetOutOfRange(_)) => ErrorCode::OffsetOutOfRange,
        _ => ErrorCode::Internal,
    };
    ClientResponse::Error {
        code,
        message: err.to_string(),
    }
}
