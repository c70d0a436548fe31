//! CLI subcommands.

pub mod debug;
pub mod ingest;
pub mod land;

use serde::de::DeserializeOwned;

/// POST JSON and decode the response, surfacing the backend's error body.
pub async fn post_json<T: DeserializeOwned>(
    url: &str,
    body: &serde_json::Value,
) -> anyhow::Result<T> {
    let response = reqwest::Client::new().post(url).json(body).send().await?;
    decode(response).await
}

pub async fn get_json<T: DeserializeOwned>(url: &str) -> anyhow::Result<T> {
    let response = reqwest::get(url).await?;
    decode(response).await
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or(body);
        anyhow::bail!("backend returned {status}: {message}");
    }
    Ok(response.json().await?)
}
