//! `voxline models check`: which models answer a one-shot REST request with this key.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

const BASE_URL: &str = "https://generativelanguage.googleapis.com";
const PROMPT: &str = "Hello, respond with 'Working!' if you receive this.";

pub const DEFAULT_CANDIDATES: &[&str] = &[
    "gemini-pro",
    "gemini-1.5-pro",
    "gemini-1.5-flash",
    "gemini-2.0-flash-exp",
];

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

/// Text of the first candidate's first text part.
fn first_text(response: &GenerateResponse) -> Option<&str> {
    response
        .candidates
        .first()?
        .content
        .as_ref()?
        .parts
        .iter()
        .find_map(|p| p.text.as_deref())
}

/// A human hint for a failed status code.
pub fn status_hint(status: u16) -> &'static str {
    match status {
        400 => "request rejected (key invalid or malformed)",
        403 => "permission denied",
        404 => "model not found or not accessible",
        429 => "quota exhausted",
        _ => "unexpected status",
    }
}

/// `abcdefghij...wxyz`; short keys are fully masked.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 14 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..10].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Ask `model` for a short reply. Ok carries the reply text.
pub async fn check_model(client: &reqwest::Client, model: &str, api_key: &str) -> anyhow::Result<String> {
    let model = model.strip_prefix("models/").unwrap_or(model);
    let url = format!("{BASE_URL}/v1beta/models/{model}:generateContent?key={api_key}");
    let body = json!({ "contents": [{ "parts": [{ "text": PROMPT }] }] });

    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("{}", e.without_url()))?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let snippet: String = text.chars().take(200).collect();
        anyhow::bail!("{status} ({}): {snippet}", status_hint(status.as_u16()));
    }

    let body: GenerateResponse = response.json().await?;
    first_text(&body)
        .map(|t| t.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("no response text"))
}

pub async fn run(models: Vec<String>, api_key: &str) -> anyhow::Result<()> {
    let models = if models.is_empty() {
        DEFAULT_CANDIDATES.iter().map(|m| m.to_string()).collect()
    } else {
        models
    };
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    println!("Checking {} model(s) with key {}", models.len(), mask_key(api_key));
    let mut working = Vec::new();
    for model in &models {
        match check_model(&client, model, api_key).await {
            Ok(reply) => {
                let reply: String = reply.chars().take(50).collect();
                println!("  ok    {model}: {reply}");
                working.push(model.as_str());
            }
            Err(e) => println!("  FAIL  {model}: {e}"),
        }
    }

    if working.is_empty() {
        anyhow::bail!("no model answered; check the key and that the Generative Language API is enabled");
    }
    println!("{} of {} model(s) answered", working.len(), models.len());
    Ok(())
}
