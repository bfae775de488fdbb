//! The send path: persist the question, stream the answer, persist the answer.
//!
//! [`ReplyService::start`] does the checks that can still reject the request
//! (ownership, readiness, retrieval) before anything is written, so a
//! rejected send leaves no trace. Once the user message is stored, a pump
//! task drains the responder into a channel and stores the assistant
//! message when the responder ends, whether or not anyone is still reading.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use pagewise_core::error::AccessError;
use pagewise_core::models::{Message, MessagePage, PageRequest};
use pagewise_core::store::RecordStore;

use crate::chat::{ByteStream, ChatTransport, HistorySource};
use crate::responder::{AnswerService, TextStream};
use crate::status;

const REPLY_BUFFER: usize = 32;

pub struct ReplyService {
    records: Arc<dyn RecordStore>,
    answers: Arc<AnswerService>,
}

impl ReplyService {
    pub fn new(records: Arc<dyn RecordStore>, answers: Arc<AnswerService>) -> Self {
        Self { records, answers }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Answer `text` about `document_id` as a byte stream of the reply.
    pub async fn start(&self, document_id: &str, user_id: &str, text: &str) -> Result<ByteStream> {
        if text.trim().is_empty() {
            return Err(AccessError::InvalidRequest("message text must not be empty".into()).into());
        }
        let doc = status::require_ready(self.records.as_ref(), document_id, user_id).await?;

        let fragments = self.answers.answer(&doc, user_id, text).await?;

        self.records
            .insert_message(&Message::user(&doc.id, user_id, text))
            .await?;
        debug!(document_id = %doc.id, "user message stored");

        let (tx, rx) = mpsc::channel(REPLY_BUFFER);
        tokio::spawn(pump(
            Arc::clone(&self.records),
            doc.id.clone(),
            user_id.to_string(),
            fragments,
            tx,
        ));
        Ok(rx.boxed())
    }
}

/// Forward fragments to the reader, then store what was produced.
async fn pump(
    records: Arc<dyn RecordStore>,
    document_id: String,
    user_id: String,
    mut fragments: TextStream,
    mut tx: mpsc::Sender<Result<Bytes>>,
) {
    let mut reply = String::new();
    let mut reader_gone = false;

    while let Some(fragment) = fragments.next().await {
        match fragment {
            Ok(text) => {
                reply.push_str(&text);
                if !reader_gone && tx.send(Ok(Bytes::from(text))).await.is_err() {
                    debug!(%document_id, "reader disconnected, finishing reply anyway");
                    reader_gone = true;
                }
            }
            Err(e) => {
                warn!(%document_id, error = %format!("{:#}", e), "responder ended early");
                break;
            }
        }
    }

    if reply.is_empty() {
        return;
    }
    let message = Message::assistant(&document_id, &user_id, reply);
    if let Err(e) = records.insert_message(&message).await {
        warn!(%document_id, error = %format!("{:#}", e), "assistant message not stored");
    }
    // `tx` drops here, so the reader sees the end only after the store write.
}

/// In-process transport over a [`ReplyService`].
pub struct LocalTransport {
    replies: Arc<ReplyService>,
    user_id: String,
}

impl LocalTransport {
    pub fn new(replies: Arc<ReplyService>, user_id: impl Into<String>) -> Self {
        Self {
            replies,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl ChatTransport for LocalTransport {
    async fn send(&self, document_id: &str, text: &str) -> Result<ByteStream> {
        self.replies.start(document_id, &self.user_id, text).await
    }
}

/// In-process history over a [`RecordStore`].
pub struct StoreHistory {
    records: Arc<dyn RecordStore>,
    user_id: String,
}

impl StoreHistory {
    pub fn new(records: Arc<dyn RecordStore>, user_id: impl Into<String>) -> Self {
        Self {
            records,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl HistorySource for StoreHistory {
    async fn fetch_page(&self, document_id: &str, page: &PageRequest) -> Result<MessagePage> {
        status::require_owned(self.records.as_ref(), document_id, &self.user_id).await?;
        self.records
            .list_messages(document_id, &self.user_id, page)
            .await
    }
}
