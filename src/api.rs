//! JSON bodies shared by the HTTP server and client.

use serde::{Deserialize, Serialize};

use pagewise_core::models::{IngestionStatus, MessagePage, MessageRecord};

/// Header carrying the caller's user id.
pub const USER_HEADER: &str = "x-user-id";
/// Header carrying the caller's email on `POST /auth/callback`.
pub const EMAIL_HEADER: &str = "x-user-email";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub document_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDocumentRequest {
    pub key: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    pub messages: Vec<MessageRecord>,
    pub next_cursor: Option<String>,
}

impl From<&MessagePage> for MessagesResponse {
    fn from(page: &MessagePage) -> Self {
        Self {
            messages: page.messages.iter().map(MessageRecord::from).collect(),
            next_cursor: page.next_cursor.clone(),
        }
    }
}

impl MessagesResponse {
    pub fn into_page(self, document_id: &str, user_id: &str) -> MessagePage {
        MessagePage {
            messages: self
                .messages
                .into_iter()
                .map(|r| r.into_message(document_id, user_id))
                .collect(),
            next_cursor: self.next_cursor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: IngestionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}
