//! Stop-hook helper: forwards the agent's hook payload to the listener.

use std::time::Duration;

use anyhow::{Context, Result};
use baton_core::ListenerSettings;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn listener_url(settings: &ListenerSettings) -> String {
    format!("http://{}:{}", settings.host, settings.port)
}

/// Build the `/hook/complete` body from whatever the agent wrote to stdin.
///
/// Input that is empty or not a JSON object still produces a body with no
/// session.
pub fn hook_body(input: &str) -> Value {
    let session = serde_json::from_str::<Value>(input)
        .ok()
        .and_then(|v| v.get("session_id").and_then(Value::as_str).map(str::to_string));

    json!({
        "session": session,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

pub async fn send(base_url: &str, body: &Value) -> Result<()> {
    let url = format!("{}/hook/complete", base_url.trim_end_matches('/'));
    let response = reqwest::Client::builder()
        .timeout(NOTIFY_TIMEOUT)
        .build()?
        .post(&url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("Failed to reach listener at {}", url))?;

    response
        .error_for_status()
        .with_context(|| format!("Listener at {} rejected the notification", url))?;
    Ok(())
}
