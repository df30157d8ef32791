//! TCP client for a local DHT daemon.
//!
//! Each request opens a fresh connection, writes one frame, and reads one
//! frame back. The daemon owns all network-facing state, so the client keeps
//! none; a [`DaemonClient`] is just an address, a timeout, and the mapping
//! from wire responses onto [`ClientError`].

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::client::{ClientError, CreatedRecord, DhtClient, RecordHandle, RecordSchema};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::registry::{OwnerSecret, RecordKey};

/// Client for a record daemon listening on a local TCP port.
#[derive(Clone, Debug)]
pub struct DaemonClient {
    addr: SocketAddr,
    request_timeout: Duration,
}

impl DaemonClient {
    pub fn new(addr: SocketAddr, request_timeout: Duration) -> Self {
        Self {
            addr,
            request_timeout,
        }
    }

    /// Send one request and read its response, bounded by the configured
    /// timeout. The timeout covers the whole exchange including connect.
    async fn call(&self, request: &DaemonRequest) -> Result<DaemonResponse, ClientError> {
        let exchange = async {
            let mut stream = TcpStream::connect(self.addr).await.map_err(transport)?;
            let encoded = serde_json::to_vec(request)
                .map_err(|e| ClientError::Protocol(format!("request encoding failed: {e}")))?;
            write_frame(&mut stream, &encoded).await.map_err(transport)?;
            let frame = read_frame(&mut stream)
                .await
                .map_err(transport)?
                .ok_or_else(|| {
                    ClientError::Transport("daemon closed the connection".to_string())
                })?;
            serde_json::from_slice(&frame)
                .map_err(|e| ClientError::Protocol(format!("response decoding failed: {e}")))
        };
        match timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(self.request_timeout)),
        }
    }
}

fn transport(err: std::io::Error) -> ClientError {
    ClientError::Transport(err.to_string())
}

fn unexpected(wanted: &str, got: &DaemonResponse) -> ClientError {
    ClientError::Protocol(format!("expected {wanted}, daemon sent {got:?}"))
}

#[async_trait]
impl DhtClient for DaemonClient {
    async fn create_record(
        &self,
        schema: RecordSchema,
        payload: &[u8],
    ) -> Result<CreatedRecord, ClientError> {
        let request = DaemonRequest::CreateRecord {
            subkey_count: schema.subkey_count,
            payload: payload.to_vec(),
        };
        match self.call(&request).await? {
            DaemonResponse::RecordCreated { key, secret } => Ok(CreatedRecord {
                key,
                owner_secret: secret,
            }),
            DaemonResponse::Error { message } => Err(ClientError::Transport(message)),
            other => Err(unexpected("record_created", &other)),
        }
    }

    async fn open_record(
        &self,
        key: &RecordKey,
        secret: &OwnerSecret,
    ) -> Result<RecordHandle, ClientError> {
        let request = DaemonRequest::OpenRecord {
            key: key.clone(),
            secret: secret.clone(),
        };
        match self.call(&request).await? {
            DaemonResponse::RecordOpened { handle } => Ok(RecordHandle::new(handle, key.clone())),
            DaemonResponse::NotFound => Err(ClientError::NotFound),
            DaemonResponse::Error { message } => Err(ClientError::Transport(message)),
            other => Err(unexpected("record_opened", &other)),
        }
    }

    async fn get_value(
        &self,
        handle: &RecordHandle,
        subkey: u16,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let request = DaemonRequest::GetValue {
            handle: handle.raw(),
            subkey,
        };
        match self.call(&request).await? {
            DaemonResponse::Value { data } => Ok(data),
            DaemonResponse::NotFound => Err(ClientError::NotFound),
            DaemonResponse::Error { message } => Err(ClientError::Transport(message)),
            other => Err(unexpected("value", &other)),
        }
    }

    async fn close_record(&self, handle: RecordHandle) -> Result<(), ClientError> {
        let request = DaemonRequest::CloseRecord {
            handle: handle.raw(),
        };
        match self.call(&request).await? {
            DaemonResponse::Done => Ok(()),
            DaemonResponse::NotFound => Err(ClientError::NotFound),
            DaemonResponse::Error { message } => Err(ClientError::Transport(message)),
            other => Err(unexpected("done", &other)),
        }
    }
}
