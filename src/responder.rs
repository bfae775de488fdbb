//! Retrieval-augmented answering.
//!
//! [`AnswerService`] embeds the question, pulls the top passages from the
//! document's namespace, assembles a prompt with recent history, and hands
//! it to a [`Responder`] that yields the answer as a stream of text
//! fragments. Two responders are provided:
//!
//! - **[`OpenAIResponder`]** streams Chat Completions over server-sent events.
//! - **[`ExtractiveResponder`]** quotes the retrieved passages back, offline.
//!
//! A responder stream may end at any point; consumers treat an early end as
//! a truncated answer, not an error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use pagewise_core::embedding::EmbeddingProvider;
use pagewise_core::models::{Document, Message, PageRequest, MAX_PAGE_SIZE};
use pagewise_core::store::{PassageHit, RecordStore, VectorIndex};
use pagewise_core::stream::Utf8StreamDecoder;

use crate::config::{ResponderConfig, RetrievalConfig};

/// Answer fragments in arrival order.
pub type TextStream = BoxStream<'static, Result<String>>;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

const SYSTEM_PROMPT: &str = "Use the following pieces of context, or the previous \
conversation if needed, to answer the user's question in markdown. If you don't know \
the answer, say that you don't know; do not make one up.";

/// Everything a responder needs to produce one answer.
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub question: String,
    pub passages: Vec<PassageHit>,
    /// Prior conversation, oldest first.
    pub history: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: &'static str,
    pub content: String,
}

/// Lay out the chat prompt: instructions, history, then context and question.
pub fn build_prompt(req: &AnswerRequest) -> Vec<PromptMessage> {
    let mut messages = vec![PromptMessage {
        role: "system",
        content: SYSTEM_PROMPT.to_string(),
    }];

    for m in &req.history {
        messages.push(PromptMessage {
            role: if m.is_user_message { "user" } else { "assistant" },
            content: m.text.clone(),
        });
    }

    let mut context = String::new();
    for hit in &req.passages {
        context.push_str(&format!("[page {}]\n{}\n\n", hit.page_number, hit.text.trim()));
    }

    messages.push(PromptMessage {
        role: "user",
        content: format!(
            "CONTEXT:\n{}USER INPUT: {}",
            context,
            req.question.trim()
        ),
    });
    messages
}

#[async_trait]
pub trait Responder: Send + Sync {
    /// Begin answering. Errors here happen before any fragment is produced.
    async fn respond(&self, req: AnswerRequest) -> Result<TextStream>;
}

/// Offline responder that streams the best passages word by word.
#[derive(Debug, Clone)]
pub struct ExtractiveResponder {
    max_words_per_passage: usize,
}

impl ExtractiveResponder {
    pub fn new() -> Self {
        Self {
            max_words_per_passage: 80,
        }
    }

    fn compose(&self, req: &AnswerRequest) -> String {
        if req.passages.is_empty() {
            return "I couldn't find anything in this document that answers that.".to_string();
        }
        let mut out = String::new();
        for hit in &req.passages {
            let words: Vec<&str> = hit
                .text
                .split_whitespace()
                .take(self.max_words_per_passage)
                .collect();
            if words.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&format!("Page {}: {}", hit.page_number, words.join(" ")));
        }
        out
    }
}

impl Default for ExtractiveResponder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Responder for ExtractiveResponder {
    async fn respond(&self, req: AnswerRequest) -> Result<TextStream> {
        let answer = self.compose(&req);
        let fragments: Vec<Result<String>> = answer
            .split_inclusive(char::is_whitespace)
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(stream::iter(fragments).boxed())
    }
}

/// One decoded server-sent event from the Chat Completions stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseData {
    Delta(String),
    Done,
}

/// Line-oriented decoder for the `data:` events OpenAI streams.
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8StreamDecoder,
    line: String,
}

impl SseDecoder {
    /// Feed raw bytes; returns the events completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseData> {
        self.line.push_str(&self.utf8.decode(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.line.find('\n') {
            let line: String = self.line.drain(..=pos).collect();
            if let Some(event) = parse_sse_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_sse_line(line: &str) -> Option<SseData> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload == "[DONE]" {
        return Some(SseData::Done);
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .map(|s| SseData::Delta(s.to_string())),
        Err(e) => {
            debug!(error = %e, "skipping malformed stream event");
            None
        }
    }
}

pub struct OpenAIResponder {
    model: String,
    temperature: f32,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIResponder {
    pub fn new(config: &ResponderConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        // Only the connect phase is bounded; the token stream has no deadline.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Responder for OpenAIResponder {
    async fn respond(&self, req: AnswerRequest) -> Result<TextStream> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "stream": true,
            "messages": build_prompt(&req),
        });

        let response = self
            .client
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let mut decoder = SseDecoder::default();
        let deltas = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(anyhow::Error::from(e))],
            })
            .flat_map(stream::iter)
            .take_while(|event| futures::future::ready(!matches!(event, Ok(SseData::Done))))
            .filter_map(|event| {
                futures::future::ready(match event {
                    Ok(SseData::Delta(text)) if !text.is_empty() => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            });
        Ok(deltas.boxed())
    }
}

pub fn create_responder(config: &ResponderConfig) -> Result<Arc<dyn Responder>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveResponder::new())),
        "openai" => Ok(Arc::new(OpenAIResponder::new(config)?)),
        other => bail!("Unknown responder provider: {}", other),
    }
}

/// Retrieval plus prompting in front of a [`Responder`].
pub struct AnswerService {
    records: Arc<dyn RecordStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    responder: Arc<dyn Responder>,
    retrieval: RetrievalConfig,
}

impl AnswerService {
    pub fn new(
        records: Arc<dyn RecordStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        responder: Arc<dyn Responder>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            records,
            index,
            embedder,
            responder,
            retrieval,
        }
    }

    /// Top passages from the document's own namespace.
    pub async fn retrieve(&self, doc: &Document, question: &str) -> Result<Vec<PassageHit>> {
        let query = self.embedder.embed_one(question).await?;
        self.index
            .query_namespace(doc.namespace(), &query, self.retrieval.top_k)
            .await
    }

    /// The most recent messages, oldest first.
    pub async fn history(&self, doc: &Document, user_id: &str) -> Result<Vec<Message>> {
        if self.retrieval.history_messages == 0 {
            return Ok(Vec::new());
        }
        let page = PageRequest::first(self.retrieval.history_messages.min(MAX_PAGE_SIZE))?;
        let mut messages = self
            .records
            .list_messages(&doc.id, user_id, &page)
            .await?
            .messages;
        messages.reverse();
        Ok(messages)
    }

    /// Start answering `question` about `doc`.
    ///
    /// History is read before the question itself is persisted, so it never
    /// contains the question being answered.
    pub async fn answer(&self, doc: &Document, user_id: &str, question: &str) -> Result<TextStream> {
        let passages = self.retrieve(doc, question).await?;
        let history = self.history(doc, user_id).await?;
        debug!(
            document_id = %doc.id,
            passages = passages.len(),
            history = history.len(),
            "answering"
        );
        self.responder
            .respond(AnswerRequest {
                question: question.to_string(),
                passages,
                history,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(page: usize, text: &str) -> PassageHit {
        PassageHit {
            page_number: page,
            text: text.to_string(),
            score: 1.0,
        }
    }

    #[test]
    fn sse_events_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let first = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choi");
        assert_eq!(first, [SseData::Delta("Hel".into())]);
        let second = decoder.push(b"ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n\n");
        assert_eq!(second, [SseData::Delta("lo".into()), SseData::Done]);
    }

    #[test]
    fn sse_ignores_role_only_and_comment_lines() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(
            b": keep-alive\r\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\r\n\r\n",
        );
        assert!(events.is_empty());
    }

    #[test]
    fn prompt_tags_pages_and_keeps_history_roles() {
        let answer = Message::assistant("d", "u", "earlier answer");
        let req = AnswerRequest {
            question: "what is it?".into(),
            passages: vec![hit(3, "the thing")],
            history: vec![Message::user("d", "u", "earlier q"), answer],
        };
        let prompt = build_prompt(&req);
        assert_eq!(prompt.len(), 4);
        assert_eq!(prompt[1].role, "user");
        assert_eq!(prompt[2].role, "assistant");
        assert!(prompt[3].content.contains("[page 3]\nthe thing"));
        assert!(prompt[3].content.ends_with("USER INPUT: what is it?"));
    }

    #[tokio::test]
    async fn extractive_stream_reassembles() {
        let responder = ExtractiveResponder::new();
        let req = AnswerRequest {
            question: "q".into(),
            passages: vec![hit(1, "alpha  beta"), hit(2, "gamma")],
            history: Vec::new(),
        };
        let fragments: Vec<String> = responder
            .respond(req)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert!(fragments.len() > 1);
        assert_eq!(fragments.concat(), "Page 1: alpha beta\n\nPage 2: gamma");
    }

    #[tokio::test]
    async fn extractive_without_passages_still_answers() {
        let responder = ExtractiveResponder::new();
        let req = AnswerRequest {
            question: "q".into(),
            passages: Vec::new(),
            history: Vec::new(),
        };
        let text: String = responder
            .respond(req)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert!(text.starts_with("I couldn't find"));
    }

    #[tokio::test]
    async fn history_window_is_capped_at_one_page() {
        use pagewise_core::embedding::HashEmbedder;
        use pagewise_core::store::memory::InMemoryStore;

        let store = Arc::new(InMemoryStore::new());
        let doc = Document::new_processing("u1", "k", "n", "");
        store.insert_document(&doc).await.unwrap();
        for i in 0..120 {
            store
                .insert_message(&Message::user(&doc.id, "u1", format!("m{}", i)))
                .await
                .unwrap();
        }
        let answers = AnswerService::new(
            store.clone(),
            store.clone(),
            Arc::new(HashEmbedder::new(8)),
            Arc::new(ExtractiveResponder::new()),
            RetrievalConfig {
                top_k: 4,
                history_messages: 150,
            },
        );
        let history = answers.history(&doc, "u1").await.unwrap();
        assert_eq!(history.len(), MAX_PAGE_SIZE);
    }
}
