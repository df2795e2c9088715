//! Implementation of the local queue client.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use indexmap::IndexMap;
use secrecy::SecretString;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_retry2::strategy::ExponentialBackoff;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;
use tracing::warn;

use super::Address;
use super::Stream;
use super::protocol::Envelope;
use super::protocol::JobState;
use super::protocol::ProtocolError;
use super::protocol::Request;
use super::protocol::Response;
use super::signing::Signer;

/// The number of times a connection is retried before giving up.
const CONNECT_ATTEMPTS: usize = 3;

/// A framed connection to the broker.
type Connection = Framed<Box<dyn Stream>, LengthDelimitedCodec>;

/// Represents an error from talking to the broker.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The broker could not be reached.
    #[error("failed to connect to the local queue at `{address}`")]
    Connect {
        /// The broker address.
        address: Address,
        /// The last connection error.
        #[source]
        source: std::io::Error,
    },
    /// Sending or receiving failed.
    #[error("failed to communicate with the local queue")]
    Io(#[from] std::io::Error),
    /// The broker closed the connection before responding.
    #[error("the local queue closed the connection")]
    Closed,
    /// The response could not be decoded.
    #[error("invalid response from the local queue")]
    Decode(#[from] serde_json::Error),
    /// The broker refused the request.
    #[error("the local queue refused the request: {0}")]
    Refused(ProtocolError),
    /// The response does not match the request.
    #[error("unexpected response from the local queue: {0:?}")]
    Unexpected(Response),
    /// The response describes a different job.
    #[error("asked the local queue for job {expected} but got job {actual}")]
    MismatchedJob {
        /// The requested job.
        expected: u64,
        /// The job in the response.
        actual: u64,
    },
}

/// A client of the local queue broker.
///
/// The connection is established on first use and re-established after a
/// communication failure.
pub struct Client {
    /// The broker address.
    address: Address,
    /// Signs requests when a secret is configured.
    signer: Option<Signer>,
    /// The current connection.
    connection: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.address)
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Constructs a new client.
    pub fn new(address: Address, secret: Option<&SecretString>) -> Self {
        Self {
            address,
            signer: secret.map(Signer::new),
            connection: Mutex::new(None),
        }
    }

    /// Gets the broker address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Sends a request and waits for its response.
    ///
    /// Requests on one client are answered in order. The connection is
    /// owned by the exchange while it is in flight, so an exchange that
    /// fails or is dropped before the response arrives closes it.
    pub async fn request(&self, request: &Request) -> Result<Response, ClientError> {
        let frame = self.encode(request)?;
        let mut slot = self.connection.lock().await;
        let mut framed = match slot.take() {
            Some(framed) => framed,
            None => self.connect().await?,
        };

        let bytes = exchange(&mut framed, frame).await?;
        *slot = Some(framed);

        let response: Response = serde_json::from_slice(&bytes)?;
        match response {
            Response::Error(refusal) => Err(ClientError::Refused(refusal.error)),
            response => Ok(response),
        }
    }

    /// Queues a command, returning the job identifier.
    pub async fn submit(
        &self,
        cmd: String,
        cwd: &Path,
        env: IndexMap<String, String>,
    ) -> Result<u64, ClientError> {
        let request = Request::Post {
            cmd,
            cwd: cwd.to_path_buf(),
            env,
        };
        Ok(self.job(&request).await?.id)
    }

    /// Gets the state of a job.
    pub async fn get(&self, id: u64) -> Result<JobState, ClientError> {
        let state = self.job(&Request::Get { id }).await?;
        if state.id != id {
            return Err(ClientError::MismatchedJob {
                expected: id,
                actual: state.id,
            });
        }

        Ok(state)
    }

    /// Cancels a job.
    pub async fn cancel(&self, id: u64) -> Result<(), ClientError> {
        self.acknowledged(&Request::Cancel { id }).await
    }

    /// Removes a job from the broker.
    pub async fn delete(&self, id: u64) -> Result<(), ClientError> {
        self.acknowledged(&Request::Delete { id }).await
    }

    /// Sends a request answered with a job state.
    async fn job(&self, request: &Request) -> Result<JobState, ClientError> {
        match self.request(request).await? {
            Response::Job(state) => Ok(state),
            response => Err(ClientError::Unexpected(response)),
        }
    }

    /// Sends a request answered with an acknowledgement.
    async fn acknowledged(&self, request: &Request) -> Result<(), ClientError> {
        match self.request(request).await? {
            Response::Ack(_) => Ok(()),
            response => Err(ClientError::Unexpected(response)),
        }
    }

    /// Serializes a request, signing it if a secret is configured.
    fn encode(&self, request: &Request) -> Result<Bytes, ClientError> {
        let payload = serde_json::to_string(request)?;
        let bytes = match &self.signer {
            Some(signer) => serde_json::to_vec(&Envelope {
                signature: signer.sign(payload.as_bytes()),
                payload,
            })?,
            None => payload.into_bytes(),
        };
        Ok(Bytes::from(bytes))
    }

    /// Connects to the broker, retrying with a backoff.
    async fn connect(&self) -> Result<Connection, ClientError> {
        let address = self.address.clone();
        let stream = Retry::spawn_notify(
            ExponentialBackoff::from_millis(50)
                .max_delay_millis(1_000)
                .take(CONNECT_ATTEMPTS),
            || try_connect(&self.address),
            move |e: &std::io::Error, _: Duration| {
                warn!(e = %e, "failed to connect to the local queue at {address}");
            },
        )
        .await
        .map_err(|source| ClientError::Connect {
            address: self.address.clone(),
            source,
        })?;

        debug!("connected to the local queue at {address}", address = self.address);
        Ok(Framed::new(stream, LengthDelimitedCodec::new()))
    }
}

/// Makes a single connection attempt.
async fn try_connect(address: &Address) -> Result<Box<dyn Stream>, RetryError<std::io::Error>> {
    let result = match address {
        Address::Tcp(address) => TcpStream::connect(address)
            .await
            .map(|s| Box::new(s) as Box<dyn Stream>),
        Address::Unix(path) => UnixStream::connect(path)
            .await
            .map(|s| Box::new(s) as Box<dyn Stream>),
    };

    result.map_err(|e| match e.kind() {
        std::io::ErrorKind::InvalidInput | std::io::ErrorKind::PermissionDenied => {
            RetryError::permanent(e)
        }
        _ => RetryError::transient(e),
    })
}

/// Sends one frame and reads the response frame.
async fn exchange(framed: &mut Connection, frame: Bytes) -> Result<Bytes, ClientError> {
    framed.send(frame).await?;
    match framed.next().await {
        Some(response) => Ok(response?.freeze()),
        None => Err(ClientError::Closed),
    }
}
