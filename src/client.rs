//! Typed client for the server's wire protocol.

use std::io;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::consensus::transport::{read_frame, write_frame};
use crate::distributed::ServerInfo;
use crate::error::RpcError;
use crate::server::{ClientRequest, ClientResponse, ErrorCode};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("offset is out of range")]
    OffsetOutOfRange,

    #[error("the contacted server is not the leader")]
    NotLeader,

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected response to the request")]
    UnexpectedResponse,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
}

pub struct Client {
    stream: TcpStream,
}

impl Client {
    /// Connects as a client; no discriminator byte, the mux classifies
    /// us by its absence.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub async fn produce(&mut self, value: impl Into<Vec<u8>>) -> Result<u64, ClientError> {
        let response = self
            .call(&ClientRequest::Produce {
                value: value.into(),
            })
            .await?;
        match response {
            ClientResponse::Produced { offset } => Ok(offset),
            other => Err(error_from(other)),
        }
    }

    pub async fn consume(&mut self, offset: u64) -> Result<Vec<u8>, ClientError> {
        let response = self.call(&ClientRequest::Consume { offset }).await?;
        match response {
            ClientResponse::Consumed { value, .. } => Ok(value),
            other => Err(error_from(other)),
        }
    }

    pub async fn get_servers(&mut self) -> Result<Vec<ServerInfo>, ClientError> {
        let response = self.call(&ClientRequest::GetServers).await?;
        match response {
            ClientResponse::Servers { servers } => Ok(servers),
            other => Err(error_from(other)),
        }
    }

    /// Switches the connection into streaming consumption starting at
    /// `offset`. The server keeps sending records, waiting out offsets
    /// that are not written yet.
    pub async fn consume_stream(mut self, offset: u64) -> Result<RecordStream, ClientError> {
        let payload = bincode::encode_to_vec(
            &ClientRequest::ConsumeStream { offset },
            bincode::config::standard(),
        )
        .map_err(RpcError::from)?;
        write_frame(&mut self.stream, &payload).await?;
        Ok(RecordStream {
            stream: self.stream,
        })
    }

    async fn call(&mut self, request: &ClientRequest) -> Result<ClientResponse, ClientError> {
        let payload = bincode::encode_to_vec(request, bincode::config::standard())
            .map_err(RpcError::from)?;
        write_frame(&mut self.stream, &payload).await?;
        let response = read_frame(&mut self.stream).await?;
        let (response, _) = bincode::decode_from_slice(&response, bincode::config::standard())
            .map_err(RpcError::from)?;
        Ok(response)
    }
}

pub struct RecordStream {
    stream: TcpStream,
}

impl RecordStream {
    /// Awaits the next record; blocks while the stream catches up with
    /// the head of the log.
    pub async fn next(&mut self) -> Result<(u64, Vec<u8>), ClientError> {
        let payload = read_frame(&mut self.stream).await?;
        let (response, _) = bincode::decode_from_slice(&payload, bincode::config::standard())
            .map_err(RpcError::from)?;
        match response {
            ClientResponse::Consumed { offset, value } => Ok((offset, value)),
            other => Err(error_from(other)),
        }
    }
}

fn error_from(response: ClientResponse) -> ClientError {
    match response {
        ClientResponse::Error { code, message } => match code {
            ErrorCode::OffsetOutOfRange => ClientError::OffsetOutOfRange,
            ErrorCode::NotLeader => ClientError::NotLeader,
            ErrorCode::Internal => ClientError::Server(message),
        },
        _ => ClientError::UnexpectedResponse,
    }
}
