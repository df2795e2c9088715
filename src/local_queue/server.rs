//! Implementation of the local queue broker server.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use anyhow::Result;
use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use parking_lot::Mutex;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::net::UnixListener;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::Address;
use super::Stream;
use super::protocol::Envelope;
use super::protocol::ProtocolError;
use super::protocol::Request;
use super::protocol::Response;
use super::protocol::decode_request;
use super::signing::Signer;
use super::table::JobTable;
use super::table::QueueJob;
use crate::backend::shell::open_output_files;
use crate::backend::shell::return_code;
use crate::status::JobStatus;

/// Allocates job identifiers.
///
/// The high 32 bits hold the unix time in seconds and the low 32 bits a
/// counter, so identifiers sort by creation time across restarts.
#[derive(Debug, Default)]
pub struct IdGenerator {
    /// The counter for the low bits.
    counter: AtomicU32,
}

impl IdGenerator {
    /// Constructs a new generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next identifier.
    pub fn next(&self) -> u64 {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        (seconds << 32) | u64::from(counter)
    }
}

/// State shared by the connection handlers and the workers.
#[derive(Debug)]
struct State {
    /// The jobs.
    table: Mutex<JobTable>,
    /// Allocates job identifiers.
    ids: IdGenerator,
    /// Sends queued job identifiers to the dispatcher.
    queue: mpsc::UnboundedSender<u64>,
    /// Verifies request signatures when a secret is configured.
    signer: Option<Signer>,
    /// Cancelled when the server shuts down.
    shutdown: CancellationToken,
}

impl State {
    /// Handles a raw request frame.
    fn handle_frame(&self, frame: &[u8]) -> Response {
        match self.decode(frame) {
            Ok(request) => self.handle(request),
            Err(e) => {
                debug!("refusing request: {e}");
                Response::error(e)
            }
        }
    }

    /// Decodes a frame, checking its signature.
    fn decode(&self, frame: &[u8]) -> Result<Request, ProtocolError> {
        let envelope = serde_json::from_slice::<Envelope>(frame).ok();
        match (&self.signer, envelope) {
            (Some(signer), Some(envelope)) => {
                if !signer.verify(envelope.payload.as_bytes(), &envelope.signature) {
                    return Err(ProtocolError::InvalidSignature);
                }
                decode_request(envelope.payload.as_bytes())
            }
            (Some(_), None) => Err(ProtocolError::InvalidSignature),
            (None, Some(envelope)) => decode_request(envelope.payload.as_bytes()),
            (None, None) => decode_request(frame),
        }
    }

    /// Handles a decoded request.
    fn handle(&self, request: Request) -> Response {
        match request {
            Request::Post { cmd, cwd, mut env } => {
                if !env.contains_key("PATH")
                    && let Some(path) = std::env::var_os("PATH")
                {
                    env.insert(String::from("PATH"), path.to_string_lossy().into_owned());
                }

                let id = self.ids.next();
                self.table.lock().insert(QueueJob {
                    id,
                    cmd,
                    cwd,
                    env,
                    state: JobStatus::Queued,
                    returncode: None,
                    token: self.shutdown.child_token(),
                });

                if self.queue.send(id).is_err() {
                    warn!("job {id} was queued after the dispatcher stopped");
                }

                info!("queued job {id}");
                Response::job(id, JobStatus::Queued, None)
            }
            Request::Get { id } => match self.table.lock().get(id) {
                Some(job) => Response::job(id, job.state, job.returncode),
                None => Response::job(id, JobStatus::Unknown, None),
            },
            Request::Cancel { id } => {
                let mut table = self.table.lock();
                if let Some(job) = table.get_mut(id) {
                    match job.state {
                        JobStatus::Queued => job.state = JobStatus::Interrupted,
                        JobStatus::Running => job.token.cancel(),
                        _ => {}
                    }
                }
                Response::ack()
            }
            Request::Delete { id } => {
                if let Some(job) = self.table.lock().remove(id) {
                    job.token.cancel();
                    debug!("deleted job {id}");
                }
                Response::ack()
            }
        }
    }

    /// Takes a queued job for execution.
    ///
    /// Returns `None` if the job was cancelled or removed while queued.
    fn take(&self, id: u64) -> Option<QueueJob> {
        let mut table = self.table.lock();
        let job = table.get_mut(id)?;
        if job.state != JobStatus::Queued {
            return None;
        }

        job.state = JobStatus::Running;
        Some(job.clone())
    }

    /// Records the outcome of a job.
    fn finish(&self, id: u64, state: JobStatus, returncode: Option<i32>) {
        if let Some(job) = self.table.lock().get_mut(id) {
            job.state = state;
            job.returncode = returncode;
        }
    }
}

/// The local queue broker.
#[derive(Debug)]
pub struct Server {
    /// The listening address.
    address: Address,
    /// The maximum number of running jobs.
    workers: usize,
    /// The size of the job table.
    max_jobs: usize,
    /// The secret requests must be signed with.
    secret: Option<SecretString>,
}

impl Server {
    /// Constructs a new server.
    pub fn new(
        address: Address,
        workers: usize,
        max_jobs: usize,
        secret: Option<SecretString>,
    ) -> Self {
        Self {
            address,
            workers: workers.max(1),
            max_jobs,
            secret,
        }
    }

    /// Serves requests until `token` is cancelled.
    ///
    /// Running jobs are killed before this returns.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        match &self.address {
            Address::Tcp(address) => {
                let listener = TcpListener::bind(address)
                    .await
                    .with_context(|| format!("failed to bind to `{address}`"))?;
                info!("local queue listening on {address}", address = self.address);
                let listener = &listener;
                self.serve(token, move || async move {
                    let (stream, _) = listener.accept().await?;
                    anyhow::Ok(Box::new(stream) as Box<dyn Stream>)
                })
                .await
            }
            Address::Unix(path) => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path).with_context(|| {
                    format!("failed to bind to `{path}`", path = path.display())
                })?;
                info!("local queue listening on {address}", address = self.address);
                let listener = &listener;
                let result = self
                    .serve(token, move || async move {
                        let (stream, _) = listener.accept().await?;
                        anyhow::Ok(Box::new(stream) as Box<dyn Stream>)
                    })
                    .await;
                std::fs::remove_file(path).ok();
                result
            }
        }
    }

    /// Runs the accept loop, the dispatcher and the workers.
    async fn serve<F, Fut>(&self, token: CancellationToken, accept: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Box<dyn Stream>>>,
    {
        if self.secret.is_none() {
            warn!("no secret is configured: requests are not authenticated");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(State {
            table: Mutex::new(JobTable::new(self.max_jobs)),
            ids: IdGenerator::new(),
            queue: tx,
            signer: self.secret.as_ref().map(Signer::new),
            shutdown: token.child_token(),
        });

        let tracker = TaskTracker::new();
        tracker.spawn(dispatch(state.clone(), rx, self.workers, tracker.clone()));

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                stream = accept() => match stream {
                    Ok(stream) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(state, stream).await {
                                debug!("connection closed: {e:#}");
                            }
                        });
                    }
                    Err(e) => error!("failed to accept a connection: {e:#}"),
                },
            }
        }

        info!("shutting down the local queue");
        state.shutdown.cancel();
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

/// Removes a unix socket left behind by a previous run.
fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| {
            format!(
                "failed to remove existing socket `{path}`",
                path = path.display()
            )
        }),
    }
}

/// Answers the requests of a single connection in order.
async fn serve_connection(state: Arc<State>, stream: Box<dyn Stream>) -> Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame.context("failed to read a request")?;
        let response = state.handle_frame(&frame);
        let bytes = serde_json::to_vec(&response)?;
        framed
            .send(Bytes::from(bytes))
            .await
            .context("failed to send a response")?;
    }
    Ok(())
}

/// Hands queued jobs to workers as slots become available.
async fn dispatch(
    state: Arc<State>,
    mut rx: mpsc::UnboundedReceiver<u64>,
    workers: usize,
    tracker: TaskTracker,
) {
    let slots = Arc::new(Semaphore::new(workers));
    loop {
        let permit = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let id = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            id = rx.recv() => match id {
                Some(id) => id,
                None => break,
            },
        };

        let Some(job) = state.take(id) else {
            debug!("skipping job {id}: no longer queued");
            continue;
        };

        let state = state.clone();
        tracker.spawn(async move {
            let (status, returncode) = execute(&job).await;
            info!("job {id} finished as {status}");
            state.finish(id, status, returncode);
            drop(permit);
        });
    }
}

/// Runs a job to completion or cancellation.
async fn execute(job: &QueueJob) -> (JobStatus, Option<i32>) {
    let mut child = match spawn(job) {
        Ok(child) => child,
        Err(e) => {
            warn!("failed to start job {id}: {e:#}", id = job.id);
            return (JobStatus::Error, None);
        }
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                let code = return_code(&status);
                (JobStatus::from_exit_code(code), Some(code))
            }
            Err(e) => {
                warn!("failed to wait for job {id}: {e}", id = job.id);
                (JobStatus::Error, None)
            }
        },
        _ = job.token.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("failed to kill job {id}: {e}", id = job.id);
            }
            let code = child.try_wait().ok().flatten().map(|s| return_code(&s));
            (JobStatus::Interrupted, code)
        }
    }
}

/// Spawns the process of a job through the shell.
fn spawn(job: &QueueJob) -> Result<tokio::process::Child> {
    let (stdout, stderr) = open_output_files(&job.cwd)?;

    tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&job.cmd)
        .current_dir(&job.cwd)
        .env_clear()
        .envs(&job.env)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn `sh`")
}

/// Constructs server state without a dispatcher.
#[cfg(test)]
fn test_state(secret: Option<&str>) -> (State, mpsc::UnboundedReceiver<u64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = State {
        table: Mutex::new(JobTable::new(100)),
        ids: IdGenerator::new(),
        queue: tx,
        signer: secret.map(|s| Signer::new(&SecretString::from(s))),
        shutdown: CancellationToken::new(),
    };
    (state, rx)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn post(state: &State) -> u64 {
        let request = json!({"method": "POST", "cmd": "true", "cwd": "/tmp", "env": {}});
        match state.handle_frame(request.to_string().as_bytes()) {
            Response::Job(job) => job.id,
            response => panic!("unexpected response {response:?}"),
        }
    }

    fn get(state: &State, id: u64) -> Response {
        state.handle_frame(json!({"method": "GET", "id": id}).to_string().as_bytes())
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let ids = IdGenerator::new();
        let mut last = 0;
        for _ in 0..1000 {
            let id = ids.next();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn post_queues_job_with_path() {
        let (state, mut rx) = test_state(None);
        let id = post(&state);
        assert_eq!(rx.try_recv().unwrap(), id);
        assert_eq!(get(&state, id), Response::job(id, JobStatus::Queued, None));
        assert!(state.table.lock().get(id).unwrap().env.contains_key("PATH"));
    }

    #[test]
    fn unknown_job() {
        let (state, _rx) = test_state(None);
        assert_eq!(get(&state, 5), Response::job(5, JobStatus::Unknown, None));
    }

    #[test]
    fn cancel_queued_job() {
        let (state, _rx) = test_state(None);
        let id = post(&state);
        let cancel = json!({"method": "CANCEL", "id": id}).to_string();
        assert_eq!(state.handle_frame(cancel.as_bytes()), Response::ack());
        assert_eq!(
            get(&state, id),
            Response::job(id, JobStatus::Interrupted, None)
        );
        assert!(state.take(id).is_none());
    }

    #[test]
    fn cancel_and_delete_are_idempotent() {
        let (state, _rx) = test_state(None);
        let id = post(&state);
        for method in ["CANCEL", "DELETE", "CANCEL", "DELETE"] {
            for target in [id, 999] {
                let request = json!({"method": method, "id": target}).to_string();
                assert_eq!(state.handle_frame(request.as_bytes()), Response::ack());
            }
        }
        assert_eq!(get(&state, id), Response::job(id, JobStatus::Unknown, None));
    }

    #[test]
    fn invalid_requests() {
        let (state, _rx) = test_state(None);
        assert_eq!(
            state.handle_frame(br#"{"method": "PATCH"}"#),
            Response::error(ProtocolError::InvalidMethod)
        );
        assert_eq!(
            state.handle_frame(b"{"),
            Response::error(ProtocolError::InvalidMessage)
        );
    }

    #[test]
    fn signatures_are_checked() {
        let (state, mut rx) = test_state(Some("secret"));
        let payload = json!({"method": "POST", "cmd": "true", "cwd": "/tmp"}).to_string();

        assert_eq!(
            state.handle_frame(payload.as_bytes()),
            Response::error(ProtocolError::InvalidSignature)
        );

        let forged = Envelope {
            payload: payload.clone(),
            signature: Signer::new(&SecretString::from("guess")).sign(payload.as_bytes()),
        };
        assert_eq!(
            state.handle_frame(&serde_json::to_vec(&forged).unwrap()),
            Response::error(ProtocolError::InvalidSignature)
        );
        assert!(rx.try_recv().is_err());

        let signed = Envelope {
            signature: Signer::new(&SecretString::from("secret")).sign(payload.as_bytes()),
            payload,
        };
        assert!(matches!(
            state.handle_frame(&serde_json::to_vec(&signed).unwrap()),
            Response::Job(_)
        ));
        assert!(rx.try_recv().is_ok());
    }
}
