//! HTTP client for a running Pagewise server.
//!
//! Implements the chat engine's [`ChatTransport`] and [`HistorySource`]
//! against `POST /message` and `GET /documents/{id}/messages`.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;

use pagewise_core::models::{MessagePage, PageRequest};

use crate::api::{ErrorBody, MessagesResponse, SendMessageRequest, USER_HEADER};
use crate::chat::{ByteStream, ChatTransport, HistorySource};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HttpChatClient {
    base_url: String,
    user_id: String,
    client: reqwest::Client,
}

impl HttpChatClient {
    /// No overall request timeout: a reply stream may run as long as it needs.
    pub fn new(base_url: &str, user_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            client,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /health`, used by the REPL to fail fast on a wrong URL.
    pub async fn health(&self) -> Result<()> {
        let response = self.client.get(self.url("/health")).send().await?;
        if !response.status().is_success() {
            bail!("server unhealthy: {}", response.status());
        }
        Ok(())
    }
}

/// Turn a non-success response into an error carrying the server's message.
async fn error_from(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => anyhow::anyhow!("{} ({}): {}", status, body.error.code, body.error.message),
        Err(_) => anyhow::anyhow!("{}: {}", status, text),
    }
}

#[async_trait]
impl ChatTransport for HttpChatClient {
    async fn send(&self, document_id: &str, text: &str) -> Result<ByteStream> {
        let response = self
            .client
            .post(self.url("/message"))
            .header(USER_HEADER, &self.user_id)
            .json(&SendMessageRequest {
                document_id: document_id.to_string(),
                text: text.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(anyhow::Error::from))
            .boxed())
    }
}

#[async_trait]
impl HistorySource for HttpChatClient {
    async fn fetch_page(&self, document_id: &str, page: &PageRequest) -> Result<MessagePage> {
        let mut query = vec![("limit", page.limit.to_string())];
        if let Some(cursor) = &page.cursor {
            query.push(("cursor", cursor.clone()));
        }

        let response = self
            .client
            .get(self.url(&format!("/documents/{}/messages", document_id)))
            .header(USER_HEADER, &self.user_id)
            .query(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        let body: MessagesResponse = response.json().await?;
        Ok(body.into_page(document_id, &self.user_id))
    }
}
