//! Transport layer for the Incus REST API
//!
//! Every response arrives wrapped in the standard Incus envelope. Errors are
//! classified by the API error code carried in the envelope, not by matching
//! message strings.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::types::Operation;
use super::Client;
use crate::error::{Error, Result};

/// Standard Incus response envelope
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiResponse {
    /// "sync", "async" or "error"
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error: String,
    /// Path of the background operation for "async" responses
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub metadata: Value,
}

fn api_error(operation: &str, code: i64, message: String) -> Error {
    match code {
        404 => Error::NotFound {
            operation: operation.to_string(),
            message,
        },
        403 => Error::Forbidden {
            operation: operation.to_string(),
            message,
        },
        409 => Error::AlreadyExists {
            operation: operation.to_string(),
            message,
        },
        _ => Error::IncusApi {
            operation: operation.to_string(),
            message,
        },
    }
}

impl Client {
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Issue a request and unwrap the response envelope. The `operation`
    /// label names the API call in every error, like "GetInstanceState".
    pub(crate) async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
        operation: &str,
    ) -> Result<ApiResponse> {
        let mut request = self.http.request(method, self.url(path));
        if !self.project.is_empty() {
            request = request.query(&[("project", self.project.as_str())]);
        }
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let bytes = response.bytes().await?;
        let envelope: ApiResponse = serde_json::from_slice(&bytes).map_err(|e| Error::IncusApi {
            operation: operation.to_string(),
            message: format!("invalid response envelope: {e}"),
        })?;

        if envelope.kind == "error" {
            return Err(api_error(operation, envelope.error_code, envelope.error));
        }
        Ok(envelope)
    }

    /// GET a resource and decode the envelope metadata.
    pub(crate) async fn api_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        operation: &str,
    ) -> Result<T> {
        let envelope = self.call(Method::GET, path, query, None, operation).await?;
        serde_json::from_value(envelope.metadata).map_err(|e| Error::IncusApi {
            operation: operation.to_string(),
            message: format!("invalid response metadata: {e}"),
        })
    }

    /// Wait for a background operation to complete. An operation that has
    /// already been garbage-collected by the hypervisor counts as success.
    pub(crate) async fn wait_operation(
        &self,
        operation: &str,
        operation_path: &str,
    ) -> Result<Operation> {
        if operation_path.is_empty() {
            return Ok(Operation::default());
        }

        match self
            .call(
                Method::GET,
                &format!("{operation_path}/wait"),
                &[],
                None,
                operation,
            )
            .await
        {
            Ok(envelope) => {
                let op: Operation = serde_json::from_value(envelope.metadata).unwrap_or_default();
                if op.failed() {
                    let message = if op.err.is_empty() { op.status.clone() } else { op.err.clone() };
                    return Err(Error::OperationFailed {
                        operation: operation.to_string(),
                        message,
                    });
                }
                Ok(op)
            }
            Err(e) if e.is_not_found() => Ok(Operation::default()),
            Err(e) => Err(e),
        }
    }

    /// Issue a request that spawns a background operation and wait for it.
    pub(crate) async fn call_and_wait(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
        operation: &str,
    ) -> Result<Operation> {
        let envelope = self.call(method, path, query, body, operation).await?;
        self.wait_operation(operation, &envelope.operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_api_error_classification() {
        assert_matches!(
            api_error("GetInstanceState", 404, "Instance not found".into()),
            Error::NotFound { .. }
        );
        assert_matches!(
            api_error("CreateProfile", 403, "not authorized".into()),
            Error::Forbidden { .. }
        );
        assert_matches!(
            api_error("CreateProfile", 409, "The profile already exists".into()),
            Error::AlreadyExists { .. }
        );
        assert_matches!(
            api_error("CreateInstance", 500, "boom".into()),
            Error::IncusApi { .. }
        );
    }

    #[test]
    fn test_envelope_parsing() {
        let envelope: ApiResponse = serde_json::from_str(
            r#"{"type":"async","status":"Operation created","status_code":100,
                "operation":"/1.0/operations/8efa2ab7","metadata":{"id":"8efa2ab7"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.kind, "async");
        assert_eq!(envelope.operation, "/1.0/operations/8efa2ab7");
    }
}
