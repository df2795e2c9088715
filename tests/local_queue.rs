//! Local queue tests.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use slivka::backend::Backend;
use slivka::backend::Command;
use slivka::backend::LocalQueueBackend;
use slivka::local_queue::Address;
use slivka::local_queue::Client;
use slivka::local_queue::Request;
use slivka::local_queue::Response;
use slivka::local_queue::Server;
use slivka::local_queue::client::ClientError;
use slivka::local_queue::protocol::JobState;
use slivka::local_queue::protocol::ProtocolError;
use slivka::status::JobStatus;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;

/// A broker listening on a unix socket in a temporary directory.
struct Broker {
    /// The directory holding the socket and job directories.
    dir: tempfile::TempDir,
    /// The socket address.
    address: Address,
    /// Stops the broker.
    token: CancellationToken,
    /// The broker task.
    task: JoinHandle<anyhow::Result<()>>,
}

impl Broker {
    async fn start(workers: usize, secret: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("queue.sock");
        let address = Address::Unix(socket.clone());
        let token = CancellationToken::new();

        let server = Server::new(
            address.clone(),
            workers,
            100,
            secret.map(|s| SecretString::from(s.to_string())),
        );
        let task = tokio::spawn(server.run(token.clone()));

        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Self {
            dir,
            address,
            token,
            task,
        }
    }

    fn client(&self, secret: Option<&str>) -> Client {
        let secret = secret.map(|s| SecretString::from(s.to_string()));
        Client::new(self.address.clone(), secret.as_ref())
    }

    fn job_dir(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    async fn stop(self) {
        self.token.cancel();
        self.task.await.unwrap().unwrap();
        assert!(!self.dir.path().join("queue.sock").exists());
    }
}

/// Serves `GET` requests on a unix socket, answering each after `delay`
/// with the state of the requested job shifted by `offset`.
fn slow_broker(socket: &Path, delay: Duration, offset: u64) -> JoinHandle<()> {
    let listener = UnixListener::bind(socket).unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                while let Some(Ok(frame)) = framed.next().await {
                    let Ok(Request::Get { id }) = serde_json::from_slice(&frame) else {
                        return;
                    };

                    tokio::time::sleep(delay).await;
                    let response = Response::job(id + offset, JobStatus::Running, None);
                    let bytes = serde_json::to_vec(&response).unwrap();
                    if framed.send(Bytes::from(bytes)).await.is_err() {
                        return;
                    }
                }
            });
        }
    })
}

async fn wait(client: &Client, id: u64) -> JobState {
    for _ in 0..200 {
        let state = client.get(id).await.unwrap();
        if state.state.is_finished() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    panic!("job {id} did not finish");
}

#[tokio::test]
async fn runs_submitted_commands() {
    let broker = Broker::start(2, None).await;
    let client = broker.client(None);
    let cwd = broker.job_dir("echo");

    let id = client
        .submit(String::from("echo hello"), &cwd, IndexMap::new())
        .await
        .unwrap();

    let state = wait(&client, id).await;
    assert_eq!(state.state, JobStatus::Completed);
    assert_eq!(state.returncode, Some(0));
    assert_eq!(
        std::fs::read_to_string(cwd.join("stdout")).unwrap(),
        "hello\n"
    );

    broker.stop().await;
}

#[tokio::test]
async fn reports_failures() {
    let broker = Broker::start(1, None).await;
    let client = broker.client(None);
    let cwd = broker.job_dir("fail");

    let id = client
        .submit(String::from("exit 3"), &cwd, IndexMap::new())
        .await
        .unwrap();

    let state = wait(&client, id).await;
    assert_eq!(state.state, JobStatus::Failed);
    assert_eq!(state.returncode, Some(3));

    broker.stop().await;
}

#[tokio::test]
async fn unknown_jobs() {
    let broker = Broker::start(1, None).await;
    let client = broker.client(None);

    let state = client.get(12345).await.unwrap();
    assert_eq!(state.state, JobStatus::Unknown);

    // Cancelling and deleting unknown jobs is acknowledged.
    client.cancel(12345).await.unwrap();
    client.delete(12345).await.unwrap();

    broker.stop().await;
}

#[tokio::test]
async fn cancels_running_jobs() {
    let broker = Broker::start(1, None).await;
    let client = broker.client(None);
    let cwd = broker.job_dir("sleep");

    let id = client
        .submit(String::from("sleep 30"), &cwd, IndexMap::new())
        .await
        .unwrap();

    for _ in 0..100 {
        if client.get(id).await.unwrap().state == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.cancel(id).await.unwrap();
    client.cancel(id).await.unwrap();

    let state = wait(&client, id).await;
    assert_eq!(state.state, JobStatus::Interrupted);

    client.delete(id).await.unwrap();
    assert_eq!(client.get(id).await.unwrap().state, JobStatus::Unknown);

    broker.stop().await;
}

#[tokio::test]
async fn cancels_queued_jobs() {
    let broker = Broker::start(1, None).await;
    let client = broker.client(None);

    let first = client
        .submit(String::from("sleep 30"), &broker.job_dir("a"), IndexMap::new())
        .await
        .unwrap();
    let second = client
        .submit(String::from("echo never"), &broker.job_dir("b"), IndexMap::new())
        .await
        .unwrap();

    client.cancel(second).await.unwrap();
    assert_eq!(
        client.get(second).await.unwrap().state,
        JobStatus::Interrupted
    );

    client.cancel(first).await.unwrap();
    assert_eq!(wait(&client, first).await.state, JobStatus::Interrupted);
    assert!(!broker.dir.path().join("b").join("stdout").exists());

    broker.stop().await;
}

#[tokio::test]
async fn signed_requests() {
    let broker = Broker::start(1, Some("s3cret")).await;

    let client = broker.client(Some("s3cret"));
    let cwd = broker.job_dir("signed");
    let id = client
        .submit(String::from("true"), &cwd, IndexMap::new())
        .await
        .unwrap();
    assert_eq!(wait(&client, id).await.state, JobStatus::Completed);

    for secret in [None, Some("wrong")] {
        let client = broker.client(secret);
        match client.get(id).await {
            Err(ClientError::Refused(error)) => {
                assert_eq!(error, ProtocolError::InvalidSignature)
            }
            other => panic!("expected a refusal, got {other:?}"),
        }
    }

    broker.stop().await;
}

#[tokio::test]
async fn backend_round_trip() {
    let broker = Broker::start(2, None).await;
    let backend = LocalQueueBackend::new(broker.address.clone(), None);

    let commands: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|name| Command {
            args: vec![String::from("echo"), format!("job {name}")],
            cwd: broker.job_dir(name),
            env: IndexMap::new(),
        })
        .collect();

    let jobs = backend.start(&commands).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].cwd, commands[0].cwd);

    let mut statuses = Vec::new();
    for _ in 0..200 {
        statuses = backend.status(&jobs).await.unwrap();
        if statuses.iter().all(|s| s.is_finished()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(statuses, [JobStatus::Completed, JobStatus::Completed]);
    assert_eq!(
        std::fs::read_to_string(Path::new(&commands[1].cwd).join("stdout")).unwrap(),
        "job b\n"
    );

    broker.stop().await;
}

#[tokio::test]
async fn unreachable_broker() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::new(Address::Unix(dir.path().join("missing.sock")), None);
    assert!(matches!(
        client.get(1).await,
        Err(ClientError::Connect { .. })
    ));
}

#[tokio::test]
async fn abandoned_requests_do_not_answer_later_ones() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("slow.sock");
    let broker = slow_broker(&socket, Duration::from_millis(200), 0);
    let client = Client::new(Address::Unix(socket), None);

    let abandoned = tokio::time::timeout(Duration::from_millis(50), client.get(1)).await;
    assert!(abandoned.is_err());

    let state = client.get(2).await.unwrap();
    assert_eq!(state.id, 2);
    assert_eq!(state.state, JobStatus::Running);

    broker.abort();
}

#[tokio::test]
async fn responses_about_other_jobs_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("wrong.sock");
    let broker = slow_broker(&socket, Duration::ZERO, 1);
    let client = Client::new(Address::Unix(socket), None);

    match client.get(1).await {
        Err(ClientError::MismatchedJob { expected, actual }) => {
            assert_eq!((expected, actual), (1, 2));
        }
        other => panic!("expected a mismatched job, got {other:?}"),
    }

    broker.abort();
}
