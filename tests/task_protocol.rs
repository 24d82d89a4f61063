//! Wire-protocol integration tests.
//!
//! Checks the request/result payload shapes the transports expose and the
//! behaviour of `run_task`, the shared entry point behind both front ends.

use scriptpilot::command::{TaskRequest, TaskResult};
use scriptpilot::config::Config;
use scriptpilot::server::run_task;
use serde_json::json;

fn request(v: serde_json::Value) -> TaskRequest {
    serde_json::from_value(v).unwrap()
}

#[tokio::test]
async fn test_success_result_shape() {
    let config = Config::default();
    let req = request(json!({
        "Variables": { "keyword": "rust" },
        "Commands": [
            { "Kind": "log", "Key": "keyword" },
            { "Kind": "var", "Key": "count", "Value": "1 + 2" }
        ]
    }));
    let result = run_task(req, &config).await;

    let v = serde_json::to_value(&result).unwrap();
    assert_eq!(v["Status"], "success");
    assert_eq!(v["Message"], "SUCCESS");
    assert_eq!(v["Variables"]["keyword"], "rust");
    assert_eq!(v["Variables"]["count"], "3");
    assert!(v["Logs"].as_array().unwrap().iter().any(|l| {
        l.as_str().map(|s| s.contains("rust")).unwrap_or(false)
    }));
    assert!(v["Diagnostics"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_failure_result_carries_the_error_message() {
    let config = Config::default();
    let req = request(json!({
        "Commands": [
            { "Kind": "throw", "Value": "login failed" }
        ]
    }));
    let result = run_task(req, &config).await;
    assert_eq!(result.status, "failure");
    assert_eq!(result.message, "login failed");
}

#[tokio::test]
async fn test_echoed_input_parses_back_to_the_request() {
    let config = Config::default();
    let req = request(json!({
        "Variables": { "url": "https://example.com" },
        "Commands": [
            { "Kind": "log", "Comment": "say hi", "Value": "hi" }
        ]
    }));
    let result = run_task(req, &config).await;
    let echoed: TaskRequest = serde_json::from_str(&result.echoed_input).unwrap();
    assert_eq!(echoed.commands.len(), 1);
    assert_eq!(echoed.commands[0].kind, "log");
    assert_eq!(echoed.commands[0].comment.as_deref(), Some("say hi"));
    assert_eq!(
        echoed.variables.get("url").map(String::as_str),
        Some("https://example.com")
    );
}

#[tokio::test]
async fn test_run_task_applies_the_default_time_budget() {
    let mut config = Config::default();
    config.request_timeout_ms = 50;
    let req = request(json!({
        "Commands": [
            { "Kind": "wait", "Value": "10000" }
        ]
    }));
    let result = run_task(req, &config).await;
    assert_eq!(result.status, "failure");
    assert!(result.message.contains("timed out"));
}

#[tokio::test]
async fn test_explicit_budget_overrides_the_default() {
    let mut config = Config::default();
    config.request_timeout_ms = 50;
    let req = request(json!({
        "TimeoutMillis": 5000,
        "Commands": [
            { "Kind": "wait", "Value": "200" }
        ]
    }));
    let result = run_task(req, &config).await;
    assert_eq!(result.status, "success");
}

#[tokio::test]
async fn test_command_logs_record_kind_and_comment() {
    let config = Config::default();
    let req = request(json!({
        "Commands": [
            { "Kind": "var", "Comment": "seed it", "Key": "a", "Value": "\"1\"" }
        ]
    }));
    let result = run_task(req, &config).await;
    assert!(result
        .logs
        .iter()
        .any(|l| l.contains("var") && l.contains("seed it")));
}

#[tokio::test]
async fn test_malformed_document_is_rejected_without_a_session() {
    let raw = r#"{ "Commands": "not-a-list" }"#;
    let parsed = serde_json::from_str::<TaskRequest>(raw);
    assert!(parsed.is_err());
    let reply = TaskResult::rejected(format!("invalid task document: {}", parsed.unwrap_err()), raw);
    assert_eq!(reply.status, "failure");
    assert_eq!(reply.echoed_input, raw);
}

#[tokio::test]
async fn test_js_step_merges_returned_map_into_variables() {
    let config = Config::default();
    let req = request(json!({
        "Commands": [
            { "Kind": "js", "Value": "#{ token: \"abc\", attempts: 3 }" }
        ]
    }));
    let result = run_task(req, &config).await;
    assert_eq!(result.variables.get("token").map(String::as_str), Some("abc"));
    assert_eq!(result.variables.get("attempts").map(String::as_str), Some("3"));
}
