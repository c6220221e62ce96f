//! Cloud-init bootstrap status
//!
//! Bootstrap success is gated on the status artifact cloud-init maintains
//! inside the instance. A read or parse failure maps to Unknown, never to
//! Error: querying an instance before its first boot finishes must not be
//! mistaken for a failed bootstrap.

use serde::Deserialize;

use crate::error::Error;
use crate::incus::Client;

/// Path of the status artifact inside the instance.
pub const STATUS_PATH: &str = "/run/cloud-init/status.json";

/// Bootstrap status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The status could not be retrieved or understood
    Unknown,
    /// cloud-init completed successfully
    Done,
    /// cloud-init is still running
    Running,
    /// cloud-init failed
    Error,
}

#[derive(Debug, Default, Deserialize)]
struct StatusJson {
    #[serde(default)]
    v1: StatusV1,
}

#[derive(Debug, Default, Deserialize)]
struct StatusV1 {
    /// Currently running stage, null once all stages finished
    #[serde(default)]
    stage: Option<String>,
    #[serde(default, rename = "init-local")]
    init_local: Stage,
    #[serde(default)]
    init: Stage,
    #[serde(default, rename = "modules-config")]
    modules_config: Stage,
    #[serde(default, rename = "modules-final")]
    modules_final: Stage,
}

#[derive(Debug, Default, Deserialize)]
struct Stage {
    #[serde(default)]
    errors: Vec<String>,
}

/// Parse the contents of the cloud-init status artifact.
///
/// Returns one of:
/// - `(Status::Done, None)`
/// - `(Status::Running, None)`
/// - `(Status::Error, None)`
/// - `(Status::Unknown, Some(error describing why))`
pub fn parse_status(data: Option<&[u8]>) -> (Status, Option<Error>) {
    let Some(data) = data else {
        return (
            Status::Unknown,
            Some(Error::CloudInitStatus("empty status.json data".to_string())),
        );
    };

    let status: StatusJson = match serde_json::from_slice(data) {
        Ok(status) => status,
        Err(e) => {
            return (
                Status::Unknown,
                Some(Error::CloudInitStatus(format!(
                    "failed to parse status.json: {e}"
                ))),
            );
        }
    };

    let v1 = &status.v1;
    let errors = v1.init_local.errors.len()
        + v1.init.errors.len()
        + v1.modules_config.errors.len()
        + v1.modules_final.errors.len();

    if errors > 0 {
        (Status::Error, None)
    } else if v1.stage.is_some() {
        (Status::Running, None)
    } else {
        (Status::Done, None)
    }
}

/// Read and parse the cloud-init status of an instance.
pub async fn check_status(client: &Client, instance: &str) -> (Status, Option<Error>) {
    match client.pull_file(instance, STATUS_PATH).await {
        Ok(data) => parse_status(Some(&data)),
        Err(e) => (
            Status::Unknown,
            Some(Error::CloudInitStatus(format!(
                "failed to read {STATUS_PATH}: {e}"
            ))),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DONE: &str = r#"{"v1": {"datasource": "nocloud", "stage": null,
        "init": {"errors": [], "start": 1.0, "finished": 2.0},
        "init-local": {"errors": [], "start": 0.5, "finished": 0.9},
        "modules-config": {"errors": [], "start": 2.1, "finished": 2.5},
        "modules-final": {"errors": [], "start": 2.6, "finished": 3.0}}}"#;

    const RUNNING: &str = r#"{"v1": {"datasource": "nocloud", "stage": "modules-final",
        "init": {"errors": [], "start": 1.0, "finished": 2.0},
        "init-local": {"errors": [], "start": 0.5, "finished": 0.9},
        "modules-config": {"errors": [], "start": 2.1, "finished": 2.5},
        "modules-final": {"errors": [], "start": 2.6, "finished": 0}}}"#;

    const ERROR: &str = r#"{"v1": {"datasource": "nocloud", "stage": null,
        "init": {"errors": [], "start": 1.0, "finished": 2.0},
        "init-local": {"errors": [], "start": 0.5, "finished": 0.9},
        "modules-config": {"errors": [], "start": 2.1, "finished": 2.5},
        "modules-final": {"errors": ["Runcmd failed with exit code 1"], "start": 2.6, "finished": 3.0}}}"#;

    #[test]
    fn test_nil_input() {
        let (status, err) = parse_status(None);
        assert_eq!(status, Status::Unknown);
        assert!(err.is_some());
    }

    #[test]
    fn test_invalid_json() {
        let (status, err) = parse_status(Some(b"invalid json"));
        assert_eq!(status, Status::Unknown);
        assert!(err.is_some());
    }

    #[test]
    fn test_done() {
        let (status, err) = parse_status(Some(DONE.as_bytes()));
        assert_eq!(status, Status::Done);
        assert!(err.is_none());
    }

    #[test]
    fn test_running() {
        let (status, err) = parse_status(Some(RUNNING.as_bytes()));
        assert_eq!(status, Status::Running);
        assert!(err.is_none());
    }

    #[test]
    fn test_error() {
        let (status, err) = parse_status(Some(ERROR.as_bytes()));
        assert_eq!(status, Status::Error);
        assert!(err.is_none());
    }

    #[test]
    fn test_errors_win_over_stage() {
        // a populated stage does not mask reported errors
        let data = r#"{"v1": {"stage": "init",
            "init": {"errors": ["boom"]},
            "init-local": {"errors": []},
            "modules-config": {"errors": []},
            "modules-final": {"errors": []}}}"#;
        let (status, _) = parse_status(Some(data.as_bytes()));
        assert_eq!(status, Status::Error);
    }
}
