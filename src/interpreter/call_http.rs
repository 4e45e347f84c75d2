//! `CallHttpInstance` (spec §4.3.8).

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

use crate::auth::AuthPolicy;
use crate::expr::{eval, Scope};
use crate::workflow::error::WorkflowError;
use crate::workflow::task::{CallHttpTask, HttpOutput};

/// Execute one HTTP call task to completion. There is no suspension point
/// here: the call either returns within this step or raises a
/// `COMMUNICATION`/`TIMEOUT` error, per spec's adopted async contract (§9
/// Open Questions: `output ∈ {CONTENT, RAW, RESPONSE}` is canonical).
pub async fn execute(
    task: &CallHttpTask,
    scope: &Scope,
    secrets: &HashMap<String, String>,
    client: &reqwest::Client,
) -> Result<Value, WorkflowError> {
    let method = parse_method(&task.method)?;

    let mut url = reqwest::Url::parse(&task.endpoint)
        .map_err(|e| WorkflowError::configuration(format!("invalid endpoint: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        for (key, valuable) in &task.query {
            let value = resolve_valuable(valuable, scope)?;
            pairs.append_pair(key, &to_query_string(&value));
        }
    }

    let mut builder = client.request(method, url.clone());
    for (key, valuable) in &task.headers {
        let value = resolve_valuable(valuable, scope)?;
        builder = builder.header(key, to_query_string(&value));
    }
    if let Some(policy) = &task.authentication {
        builder = policy.apply(builder, secrets).await?;
    }
    if let Some(body) = &task.body {
        builder = builder.json(body);
    }

    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            WorkflowError::timeout(format!("request to {} timed out", task.endpoint))
        } else {
            WorkflowError::communication(format!("request to {} failed: {e}", task.endpoint))
        }
    })?;

    let status = response.status();
    let is_redirect = status.is_redirection();
    if is_redirect && !task.redirect {
        return Err(WorkflowError::communication(format!(
            "received redirect status {status} with redirect disabled"
        ))
        .with_status(status.as_u16()));
    }

    let headers: serde_json::Map<String, Value> = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.to_string(),
                json!(v.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| WorkflowError::communication(format!("failed to read response body: {e}")))?;

    if !status.is_success() && !is_redirect {
        let body_text = String::from_utf8_lossy(&bytes).to_string();
        return Err(
            WorkflowError::communication(format!("request to {} failed", task.endpoint))
                .with_status(status.as_u16())
                .with_detail(body_text),
        );
    }

    match task.output {
        HttpOutput::Raw => Ok(json!(BASE64.encode(&bytes))),
        HttpOutput::Content => parse_json_body(&bytes),
        HttpOutput::Response => {
            let content = parse_json_body(&bytes).unwrap_or_else(|_| {
                json!(String::from_utf8_lossy(&bytes).to_string())
            });
            Ok(json!({
                "request": {
                    "method": task.method,
                    "uri": url.to_string(),
                },
                "statusCode": status.as_u16(),
                "headers": headers,
                "content": content,
            }))
        }
    }
}

fn parse_json_body(bytes: &[u8]) -> Result<Value, WorkflowError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes)
        .map_err(|e| WorkflowError::communication(format!("response body is not valid JSON: {e}")))
}

fn parse_method(method: &str) -> Result<reqwest::Method, WorkflowError> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(reqwest::Method::GET),
        "POST" => Ok(reqwest::Method::POST),
        "PUT" => Ok(reqwest::Method::PUT),
        "DELETE" => Ok(reqwest::Method::DELETE),
        "PATCH" => Err(WorkflowError::configuration(
            "PATCH is not a supported call/http method",
        )),
        other => Err(WorkflowError::configuration(format!(
            "unsupported call/http method `{other}`"
        ))),
    }
}

fn resolve_valuable(
    valuable: &crate::workflow::task::Valuable,
    scope: &Scope,
) -> Result<Value, WorkflowError> {
    match valuable.as_expression() {
        Some(expr) => Ok(eval(expr, scope)?),
        None => Ok(valuable.as_literal().clone()),
    }
}

fn to_query_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn content_output_returns_parsed_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let task = CallHttpTask {
            base: Default::default(),
            method: "GET".to_string(),
            endpoint: format!("{}/ping", server.uri()),
            query: Default::default(),
            headers: Default::default(),
            body: None,
            authentication: None,
            output: HttpOutput::Content,
            redirect: false,
        };

        let scope = Scope::new(Value::Null);
        let client = reqwest::Client::new();
        let result = execute(&task, &scope, &HashMap::new(), &client)
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn non_2xx_status_is_a_communication_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fail"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let task = CallHttpTask {
            base: Default::default(),
            method: "GET".to_string(),
            endpoint: format!("{}/fail", server.uri()),
            query: Default::default(),
            headers: Default::default(),
            body: None,
            authentication: None,
            output: HttpOutput::Content,
            redirect: false,
        };

        let scope = Scope::new(Value::Null);
        let client = reqwest::Client::new();
        let err = execute(&task, &scope, &HashMap::new(), &client)
            .await
            .unwrap_err();
        assert_eq!(err.status, 503);
    }

    #[test]
    fn patch_method_is_rejected() {
        assert!(parse_method("PATCH").is_err());
    }
}
