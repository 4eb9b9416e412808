use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{Completion, DispatchOutcome, DispatchRequest, Executor};
use crate::error::{Error, Result};
use crate::model::ExecutionResult;

pub const HTTP_EXECUTOR: &str = "http";

/// Response bytes read before the rest is ignored.
pub const MAX_RESPONSE_BYTES: usize = 8 * 1024;

/// Run template spec for the `http` executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub url: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub response_policy: ResponsePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePolicy {
    /// Statuses that count as a passed execution.
    #[serde(default = "default_status_codes")]
    pub status_codes: Vec<u16>,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            status_codes: default_status_codes(),
        }
    }
}

fn default_status_codes() -> Vec<u16> {
    vec![200]
}

impl HttpSpec {
    pub fn parse(spec: &Map<String, Value>) -> Result<Self> {
        let parsed: HttpSpec = serde_json::from_value(Value::Object(spec.clone()))
            .map_err(|e| Error::Config(format!("invalid http spec: {e}")))?;
        if parsed.url.trim().is_empty() {
            return Err(Error::Config("invalid http spec: url is required".into()));
        }
        Ok(parsed)
    }
}

/// POSTs the resolved payload and finishes the execution from the response.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .pool_max_idle_per_host(10)
                .build()
                .unwrap_or_default(),
            timeout,
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn validate(&self, spec: &Map<String, Value>) -> Result<()> {
        HttpSpec::parse(spec).map(|_| ())
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome> {
        let spec = HttpSpec::parse(&request.spec)?;

        let mut body = spec.payload.clone();
        body.insert("stageId".into(), Value::String(request.stage_id.to_string()));
        body.insert("executionId".into(), Value::String(request.execution_id.to_string()));

        let mut call = self.client.post(&spec.url).timeout(self.timeout).json(&body);
        for (name, value) in &spec.headers {
            call = call.header(name, value);
        }

        let mut response = call
            .send()
            .await
            .map_err(|e| Error::Transient(format!("http executor request failed: {e}")))?;
        let status = response.status().as_u16();

        let mut raw = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::Transient(format!("http executor response failed: {e}")))?
        {
            let room = MAX_RESPONSE_BYTES - raw.len();
            raw.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if raw.len() >= MAX_RESPONSE_BYTES {
                break;
            }
        }

        let passed = spec.response_policy.status_codes.contains(&status);
        if !passed && status >= 500 {
            return Err(Error::Transient(format!("http executor returned {status}")));
        }

        let outputs = serde_json::from_slice::<Value>(&raw)
            .ok()
            .and_then(|v| v.get("outputs").and_then(Value::as_object).cloned())
            .unwrap_or_default();

        debug!(execution_id = %request.execution_id, status, passed, "http execution finished");

        Ok(DispatchOutcome {
            reference_id: request.execution_id.to_string(),
            completion: Some(Completion {
                result: if passed {
                    ExecutionResult::Passed
                } else {
                    ExecutionResult::Failed
                },
                outputs,
            }),
        })
    }

    async fn cancel(&self, _reference_id: &str) -> Result<()> {
        // Requests complete synchronously; nothing is left running.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn spec(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn spec_requires_url() {
        assert!(HttpSpec::parse(&spec(json!({"payload": {}}))).is_err());
        assert!(HttpSpec::parse(&spec(json!({"url": " "}))).is_err());

        let parsed = HttpSpec::parse(&spec(json!({"url": "http://x"}))).unwrap();
        assert_eq!(parsed.response_policy.status_codes, vec![200]);
    }

    /// Serve one canned response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/run", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (url, handle)
    }

    fn request(url: &str) -> DispatchRequest {
        DispatchRequest {
            stage_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            execution_token: "token".into(),
            spec: spec(json!({
                "url": url,
                "payload": {"ref": "main"},
                "headers": {"x-run": "1"},
            })),
        }
    }

    #[tokio::test]
    async fn posts_payload_and_reads_outputs() {
        let (url, server) = serve_once("200 OK", r#"{"outputs":{"version":"v2"}}"#).await;
        let request = request(&url);

        let outcome = HttpExecutor::new(Duration::from_secs(5))
            .dispatch(&request)
            .await
            .unwrap();

        let completion = outcome.completion.unwrap();
        assert_eq!(completion.result, ExecutionResult::Passed);
        assert_eq!(completion.outputs["version"], "v2");
        assert_eq!(outcome.reference_id, request.execution_id.to_string());

        let raw = server.await.unwrap();
        assert!(raw.contains("x-run: 1"));
        assert!(raw.contains(r#""ref":"main""#));
        assert!(raw.contains(&request.execution_id.to_string()));
    }

    #[tokio::test]
    async fn status_outside_policy_fails_the_execution() {
        let (url, server) = serve_once("404 Not Found", "{}").await;
        let outcome = HttpExecutor::new(Duration::from_secs(5))
            .dispatch(&request(&url))
            .await
            .unwrap();
        assert_eq!(outcome.completion.unwrap().result, ExecutionResult::Failed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let (url, server) = serve_once("503 Service Unavailable", "{}").await;
        let err = HttpExecutor::new(Duration::from_secs(5))
            .dispatch(&request(&url))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/run", listener.local_addr().unwrap());
        drop(listener);

        let err = HttpExecutor::new(Duration::from_secs(2))
            .dispatch(&request(&url))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
