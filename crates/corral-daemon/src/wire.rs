//! Messages exchanged over a container's control socket.
//!
//! Each connection carries exactly one request from the host and one
//! response from the daemon, both as a single line of JSON. Descriptors
//! travel as `SCM_RIGHTS` attached to the response.

use corral_common::error::{CorralError, Result};
use corral_common::types::{ProcessSpec, Signal, TtySpec};
use serde::{Deserialize, Serialize};

/// Largest response the host is prepared to read.
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// A request sent by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Start a program inside the container.
    Run {
        /// What to run.
        spec: ProcessSpec,
        /// Allocate a pty instead of pipes.
        #[serde(default)]
        tty: Option<TtySpec>,
    },
    /// Block until a process exits and report its status.
    Attach {
        /// Process to wait for.
        pid: i32,
    },
    /// Deliver a signal to a process.
    Signal {
        /// Target process.
        pid: i32,
        /// Signal to deliver.
        signal: Signal,
    },
}

/// The daemon's answer to a [`Request`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Pid the request concerned; zero when there was none.
    pub pid: i32,
    /// Empty on success.
    #[serde(default)]
    pub error_message: String,
    /// Exit status, set by a successful attach.
    #[serde(default)]
    pub exit_status: Option<i32>,
}

impl Response {
    /// Reply for a started or signalled process.
    #[must_use]
    pub fn ok(pid: i32) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }

    /// Reply for a process that has exited.
    #[must_use]
    pub fn exited(pid: i32, status: i32) -> Self {
        Self {
            pid,
            exit_status: Some(status),
            ..Self::default()
        }
    }

    /// Reply carrying an error.
    #[must_use]
    pub fn failed(pid: i32, error: &CorralError) -> Self {
        Self {
            pid,
            error_message: error.to_string(),
            exit_status: None,
        }
    }

    /// Whether the daemon reported an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !self.error_message.is_empty()
    }
}

/// Serializes a message as one newline-terminated JSON line.
///
/// # Errors
///
/// Returns a `Serialization` error if the message cannot be encoded.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Parses a response line.
///
/// # Errors
///
/// Returns a `Protocol` error if the line is not a valid response.
pub fn decode_response(line: &[u8]) -> Result<Response> {
    serde_json::from_slice(line).map_err(|e| CorralError::Protocol {
        message: format!("malformed response: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_request_shape() {
        let request = Request::Run {
            spec: ProcessSpec {
                path: "/bin/echo".into(),
                args: vec!["hi".into()],
                ..ProcessSpec::default()
            },
            tty: None,
        };
        let value: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["kind"], "run");
        assert_eq!(value["spec"]["path"], "/bin/echo");
    }

    #[test]
    fn signal_request_parses() {
        let request: Request =
            serde_json::from_str(r#"{"kind":"signal","pid":42,"signal":"terminate"}"#).unwrap();
        assert_eq!(
            request,
            Request::Signal {
                pid: 42,
                signal: Signal::Terminate
            }
        );
    }

    #[test]
    fn encoded_lines_end_with_newline() {
        let line = encode(&Response::exited(3, 7)).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let back = decode_response(&line).unwrap();
        assert_eq!(back.exit_status, Some(7));
        assert!(!back.is_error());
    }

    #[test]
    fn failure_carries_message() {
        let response = Response::failed(0, &CorralError::UnknownUser { user: "bob".into() });
        assert!(response.is_error());
        assert!(response.error_message.contains("bob"));
    }

    #[test]
    fn garbage_response_is_a_protocol_error() {
        assert!(matches!(
            decode_response(b"nope\n"),
            Err(CorralError::Protocol { .. })
        ));
    }
}
