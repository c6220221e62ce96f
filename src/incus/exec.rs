//! Command execution and file transfer

use reqwest::Method;
use serde_json::json;
use tracing::debug;

use super::Client;
use crate::error::{Error, Result};

impl Client {
    /// Execute a command inside an instance and wait for it to finish. The
    /// exit code is carried in the operation metadata; non-zero is an error.
    pub async fn run_command(&self, instance: &str, command: &[&str]) -> Result<()> {
        debug!("Executing {command:?} in instance {instance}");
        let op = self
            .call_and_wait(
                Method::POST,
                &format!("/1.0/instances/{instance}/exec"),
                &[],
                Some(json!({
                    "command": command,
                    "interactive": false,
                    "record-output": false,
                    "wait-for-websocket": false,
                })),
                "ExecInstance",
            )
            .await?;

        if let Some(code) = op.metadata.get("return").and_then(serde_json::Value::as_i64) {
            if code != 0 {
                return Err(Error::CommandFailed {
                    command: command.iter().map(|s| s.to_string()).collect(),
                    code,
                });
            }
        }
        Ok(())
    }

    /// Overwrite a file inside the instance. Ownership is root:root.
    pub async fn push_file(
        &self,
        instance: &str,
        path: &str,
        content: Vec<u8>,
        mode: &str,
    ) -> Result<()> {
        debug!("Writing {path} in instance {instance}");
        let url = format!(
            "{}?path={}",
            self.url(&format!("/1.0/instances/{instance}/files")),
            urlencoding::encode(path)
        );
        let mut request = self
            .http
            .post(url)
            // LXD servers understand only the X-LXD form of these headers
            .header("X-Incus-type", "file")
            .header("X-Incus-write-mode", "overwrite")
            .header("X-Incus-mode", mode)
            .header("X-Incus-uid", "0")
            .header("X-Incus-gid", "0")
            .header("X-LXD-type", "file")
            .header("X-LXD-write-mode", "overwrite")
            .header("X-LXD-mode", mode)
            .header("X-LXD-uid", "0")
            .header("X-LXD-gid", "0")
            .body(content);
        if !self.project.is_empty() {
            request = request.query(&[("project", self.project.as_str())]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::IncusApi {
                operation: "CreateInstanceFile".to_string(),
                message: format!("HTTP {status}: {body}"),
            });
        }
        Ok(())
    }

    /// Read a file from inside the instance. The content comes back raw;
    /// failures arrive as a JSON envelope instead.
    pub async fn pull_file(&self, instance: &str, path: &str) -> Result<Vec<u8>> {
        debug!("Reading {path} from instance {instance}");
        let url = format!(
            "{}?path={}",
            self.url(&format!("/1.0/instances/{instance}/files")),
            urlencoding::encode(path)
        );
        let mut request = self.http.get(url);
        if !self.project.is_empty() {
            request = request.query(&[("project", self.project.as_str())]);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            if let Ok(envelope) = serde_json::from_slice::<super::http::ApiResponse>(&bytes) {
                if envelope.kind == "error" && envelope.error_code == 404 {
                    return Err(Error::NotFound {
                        operation: "GetInstanceFile".to_string(),
                        message: envelope.error,
                    });
                }
                return Err(Error::IncusApi {
                    operation: "GetInstanceFile".to_string(),
                    message: envelope.error,
                });
            }
            return Err(Error::IncusApi {
                operation: "GetInstanceFile".to_string(),
                message: format!("HTTP {status}"),
            });
        }
        Ok(bytes.to_vec())
    }

    /// List the entries of a directory inside the instance.
    pub async fn list_instance_files(&self, instance: &str, path: &str) -> Result<Vec<String>> {
        self.api_get(
            &format!("/1.0/instances/{instance}/files"),
            &[("path", path)],
            "GetInstanceFile",
        )
        .await
    }
}
