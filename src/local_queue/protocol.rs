//! Messages exchanged with the local queue broker.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::status::JobStatus;

/// The methods understood by the broker.
const METHODS: &[&str] = &["GET", "POST", "CANCEL", "DELETE"];

/// A request sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "UPPERCASE")]
pub enum Request {
    /// Gets the state of a job.
    Get {
        /// The job identifier.
        id: u64,
    },
    /// Queues a new job.
    Post {
        /// The shell command line.
        cmd: String,
        /// The working directory.
        cwd: PathBuf,
        /// The environment of the command.
        #[serde(default)]
        env: IndexMap<String, String>,
    },
    /// Cancels a job.
    Cancel {
        /// The job identifier.
        id: u64,
    },
    /// Removes a job.
    Delete {
        /// The job identifier.
        id: u64,
    },
}

/// A signed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The serialized request.
    pub payload: String,
    /// The hex encoded signature of the payload.
    pub signature: String,
}

/// The reasons the broker refuses a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolError {
    /// The method is not known.
    #[error("invalid-method")]
    InvalidMethod,
    /// The message is not a valid request.
    #[error("invalid-message")]
    InvalidMessage,
    /// The signature is missing or does not match.
    #[error("invalid-signature")]
    InvalidSignature,
}

/// The state of a job as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    /// Always `true`.
    pub ok: bool,
    /// The job identifier.
    pub id: u64,
    /// The job state.
    pub state: JobStatus,
    /// The exit code once the process exited.
    pub returncode: Option<i32>,
}

/// A refused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refusal {
    /// Always `false`.
    pub ok: bool,
    /// The reason.
    pub error: ProtocolError,
}

/// An acknowledged request without a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Always `true`.
    pub ok: bool,
}

/// A response of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    /// The state of a job.
    Job(JobState),
    /// A refused request.
    Error(Refusal),
    /// An acknowledgement.
    Ack(Ack),
}

impl Response {
    /// Constructs a job state response.
    pub fn job(id: u64, state: JobStatus, returncode: Option<i32>) -> Self {
        Self::Job(JobState {
            ok: true,
            id,
            state,
            returncode,
        })
    }

    /// Constructs an acknowledgement.
    pub fn ack() -> Self {
        Self::Ack(Ack { ok: true })
    }

    /// Constructs a refusal.
    pub fn error(error: ProtocolError) -> Self {
        Self::Error(Refusal { ok: false, error })
    }
}

/// Decodes a request.
///
/// Unknown methods are told apart from malformed messages.
pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|_| ProtocolError::InvalidMessage)?;
    let method = value
        .get("method")
        .and_then(|m| m.as_str())
        .ok_or(ProtocolError::InvalidMessage)?;

    if !METHODS.contains(&method) {
        return Err(ProtocolError::InvalidMethod);
    }

    serde_json::from_value(value).map_err(|_| ProtocolError::InvalidMessage)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_requests() {
        assert_eq!(
            decode_request(br#"{"method": "GET", "id": 12}"#).unwrap(),
            Request::Get { id: 12 }
        );
        assert_eq!(
            decode_request(br#"{"method": "POST", "cmd": "echo hi", "cwd": "/tmp", "env": {"A": "1"}}"#)
                .unwrap(),
            Request::Post {
                cmd: String::from("echo hi"),
                cwd: PathBuf::from("/tmp"),
                env: [(String::from("A"), String::from("1"))].into_iter().collect(),
            }
        );
    }

    #[test]
    fn rejects_bad_requests() {
        assert_eq!(
            decode_request(br#"{"method": "PUT", "id": 1}"#),
            Err(ProtocolError::InvalidMethod)
        );
        assert_eq!(
            decode_request(br#"{"method": "GET"}"#),
            Err(ProtocolError::InvalidMessage)
        );
        assert_eq!(decode_request(b"not json"), Err(ProtocolError::InvalidMessage));
        assert_eq!(
            decode_request(br#"{"id": 1}"#),
            Err(ProtocolError::InvalidMessage)
        );
    }

    #[test]
    fn response_shapes() {
        assert_eq!(
            serde_json::to_value(Response::job(7, JobStatus::Queued, None)).unwrap(),
            json!({"ok": true, "id": 7, "state": "QUEUED", "returncode": null})
        );
        assert_eq!(
            serde_json::to_value(Response::ack()).unwrap(),
            json!({"ok": true})
        );
        assert_eq!(
            serde_json::to_value(Response::error(ProtocolError::InvalidMethod)).unwrap(),
            json!({"ok": false, "error": "invalid-method"})
        );
    }

    #[test]
    fn responses_decode_to_their_variant() {
        let job: Response =
            serde_json::from_str(r#"{"ok": true, "id": 7, "state": "COMPLETED", "returncode": 0}"#)
                .unwrap();
        assert_eq!(job, Response::job(7, JobStatus::Completed, Some(0)));

        let error: Response =
            serde_json::from_str(r#"{"ok": false, "error": "invalid-message"}"#).unwrap();
        assert_eq!(error, Response::error(ProtocolError::InvalidMessage));

        let ack: Response = serde_json::from_str(r#"{"ok": true}"#).unwrap();
        assert_eq!(ack, Response::ack());
    }
}
