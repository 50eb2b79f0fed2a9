use crate::error::ProxyError;
use crate::protocol::{ChatTurn, SessionCreateResponse};
use reqwest::Client;

/// HTTP client for the chat backend's session API.
#[derive(Clone)]
pub struct Backend {
    client: Client,
    base_url: String,
}

impl Backend {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: normalize_base_url(base_url),
        }
    }

    pub async fn create_session(&self) -> Result<String, ProxyError> {
        let response = self
            .client
            .put(format!("{}/sessions", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProxyError::SessionCreationFailed {
                status: response.status(),
            });
        }

        let body: SessionCreateResponse = serde_json::from_slice(&response.bytes().await?)?;
        Ok(body.data.session_id)
    }

    /// Posts one turn and hands back the raw response so the body can be streamed.
    pub async fn send_chat(
        &self,
        session_id: &str,
        turn: &ChatTurn,
    ) -> Result<reqwest::Response, ProxyError> {
        let response = self
            .client
            .post(format!("{}/sessions/{}/chat", self.base_url, session_id))
            .json(turn)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let details = response.text().await?;
            return Err(ProxyError::BackendChatFailed { status, details });
        }

        Ok(response)
    }
}

pub(crate) fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
