//! Shared plumbing for the OpenAI HTTP endpoints (Whisper, TTS)

use reqwest::Client;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

pub const TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
pub const SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

pub fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            })
    })
}

/// Get the OpenAI API key from environment
pub fn api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Pull the human-readable message out of an error body, or return it whole
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorResponse>(body)
        .map(|r| r.error.message)
        .unwrap_or_else(|_| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_extracts_detail() {
        let body = r#"{"error":{"message":"Invalid API key","type":"invalid_request_error"}}"#;
        assert_eq!(error_message(body), "Invalid API key");
    }

    #[test]
    fn error_message_passes_through_plain_text() {
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
    }
}
