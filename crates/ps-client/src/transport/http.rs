//! Request/response transport
//!
//! [`HttpBackend`] is the production [`Backend`]: reqwest for the JSON
//! endpoints and WebSocket push channels derived from the same base address.

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use ps_core::config::ClientConfig;
use ps_core::{ConnectionState, Message, SyncError};
use ps_protocol::{
    ChatRequest, ChatResponse, DecodeError, HealthResponse, PairingCodeResponse, StatusUpdate,
};

use super::{Backend, ChannelKind, PushChannel};

/// Backend reached over HTTP and WebSocket
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpBackend {
    /// Create a backend client from configuration
    pub fn new(config: ClientConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Raw connection status as reported by the backend
    pub async fn status_update(&self) -> Result<StatusUpdate, SyncError> {
        self.get_json(&self.config.endpoints.connection_status).await
    }

    /// Raw pairing code response
    pub async fn pairing_code(&self) -> Result<PairingCodeResponse, SyncError> {
        self.get_json(&self.config.endpoints.pairing_code).await
    }

    /// Send one chat turn to the non-streaming endpoint
    pub async fn send_chat(
        &self,
        message: &str,
        history: &[Message],
    ) -> Result<ChatResponse, SyncError> {
        let url = self.config.http_url(&self.config.endpoints.chat);
        let request = ChatRequest::new(message, history);
        tracing::debug!(%url, history = history.len(), "POST chat");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("POST {}: {}", url, e)))?;
        decode_response(&url, response).await
    }

    /// Check the backend health endpoint
    pub async fn health(&self) -> Result<HealthResponse, SyncError> {
        self.get_json(&self.config.endpoints.health).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        let url = self.config.http_url(path);
        tracing::debug!(%url, "GET");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("GET {}: {}", url, e)))?;
        decode_response(&url, response).await
    }
}

async fn decode_response<T: DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> Result<T, SyncError> {
    let status = response.status();
    if !status.is_success() {
        return Err(SyncError::Network(format!("{} returned {}", url, status)));
    }

    let body = response
        .text()
        .await
        .map_err(|e| SyncError::Network(format!("Reading {}: {}", url, e)))?;
    serde_json::from_str(&body).map_err(|e| SyncError::Decode(DecodeError::Json(e)))
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_status(&self) -> Result<ConnectionState, SyncError> {
        Ok(self.status_update().await?.into())
    }

    async fn fetch_pairing_code(&self) -> Result<Option<String>, SyncError> {
        let response = self.pairing_code().await?;
        if !response.success {
            tracing::debug!(
                status = %response.status,
                message = ?response.message,
                "Pairing code not available"
            );
            return Ok(None);
        }
        Ok(response.code_payload)
    }

    fn open_channel(&self, kind: ChannelKind) -> PushChannel {
        let path = match kind {
            ChannelKind::Status => &self.config.endpoints.status_channel,
            ChannelKind::Chat => &self.config.endpoints.chat_channel,
        };
        PushChannel::connect(self.config.channel_url(path))
    }
}
