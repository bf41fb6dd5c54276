use anyhow::{anyhow, Context, Result};
use serde_json::Value;

/// Bare JSON-RPC 2.0 over HTTP, shared by the bundler and paymaster clients.
#[derive(Debug, Clone)]
pub struct JsonRpcTransport {
    url: String,
    http: reqwest::Client,
}

impl JsonRpcTransport {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    /// Sends one request and returns its `result`, turning HTTP failures and
    /// JSON-RPC `error` objects into errors.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        tracing::debug!(url = %self.url, method, "json-rpc request");

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode JSON")?;
        extract_result(status, body)
    }
}

fn extract_result(status: reqwest::StatusCode, body: Value) -> Result<Value> {
    if !status.is_success() {
        return Err(anyhow!("HTTP {}: {}", status, body));
    }
    if let Some(err) = body.get("error") {
        return Err(anyhow!("RPC error: {}", err));
    }
    body.get("result")
        .cloned()
        .ok_or_else(|| anyhow!("missing result field"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use serde_json::json;

    #[test]
    fn result_is_returned_verbatim() {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "result": { "a": 1 } });
        assert_eq!(extract_result(StatusCode::OK, body).unwrap(), json!({ "a": 1 }));
    }

    #[test]
    fn null_result_is_not_an_error() {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "result": null });
        assert_eq!(extract_result(StatusCode::OK, body).unwrap(), Value::Null);
    }

    #[test]
    fn rpc_error_object_is_surfaced() {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "error": { "code": -32602, "message": "AA23 reverted" } });
        let err = extract_result(StatusCode::OK, body).unwrap_err();
        assert!(err.to_string().contains("AA23"));
    }

    #[test]
    fn http_failure_is_surfaced() {
        let body = json!({ "message": "rate limited" });
        assert!(extract_result(StatusCode::TOO_MANY_REQUESTS, body).is_err());
    }

    #[test]
    fn missing_result_is_an_error() {
        assert!(extract_result(StatusCode::OK, json!({ "jsonrpc": "2.0", "id": 1 })).is_err());
    }
}
