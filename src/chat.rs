//! Chat synchronization engine.
//!
//! [`ChatEngine`] owns the client-visible timeline of one conversation. It
//! is the only writer of the cached pages: optimistic inserts, streamed
//! assistant text, rollbacks, and refetches all go through it.
//!
//! # Send cycle
//!
//! ```text
//! IDLE ──▶ SENDING ──▶ STREAMING ──▶ SETTLED ──▶ IDLE
//!             │            │
//!             └────────────┴──▶ ROLLED_BACK ──▶ IDLE   (transport failure)
//! ```
//!
//! One cycle runs at a time per engine. A send issued while another is in
//! flight waits for it to settle, so its snapshot already contains the
//! earlier exchange. A mid-stream failure is a truncation: the partial text
//! is kept and the cycle settles normally. Dropping a send future mid-cycle
//! (a timeout, an aborted task) also returns the engine to `IDLE`.
//!
//! # Cache consistency
//!
//! Every refetch records the engine's generation when it starts and is
//! discarded if a send began in the meantime. Background refreshes are also
//! cancelled outright when a send starts.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pagewise_core::models::{Message, MessagePage, PageRequest};
use pagewise_core::stream::ResponseFold;
use pagewise_core::timeline::{CachePage, Timeline};

/// Raw response body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

const EVENT_CAPACITY: usize = 256;

/// Where the engine sends a message and reads the streamed reply.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Issue `{document_id, text}`. An `Err` means nothing was accepted.
    async fn send(&self, document_id: &str, text: &str) -> Result<ByteStream>;
}

/// Where the engine reads paginated history.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_page(&self, document_id: &str, page: &PageRequest) -> Result<MessagePage>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// The request failed before a reply stream was established.
    #[error("message could not be sent: {0}")]
    StreamTransport(String),
    /// A refetch after settling failed; the shown history may be stale.
    #[error("history could not be refreshed: {0}")]
    StaleCache(String),
    #[error("history could not be loaded: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    Sending,
    Streaming,
    Settled,
    RolledBack,
}

impl SendPhase {
    fn in_flight(self) -> bool {
        matches!(self, SendPhase::Sending | SendPhase::Streaming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The input was blank; nothing was sent.
    Ignored,
    Settled { reply: String, truncated: bool },
}

/// Notifications for renderers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The user's message was added optimistically.
    UserMessage(Message),
    /// The assistant placeholder now reads `text` in full.
    Reply { text: String },
    Settled { reply: String, truncated: bool },
    /// The send failed and the timeline was restored; `notice` is for the user.
    RolledBack { notice: String },
    /// History was replaced by a refetch.
    Refreshed,
}

struct EngineState {
    timeline: Timeline,
    input: String,
    phase: SendPhase,
    loading: usize,
    generation: u64,
    refresh: Option<CancellationToken>,
    /// Set when a send was abandoned; the cached pages may not match the server.
    stale: bool,
}

/// Pre-send state, restored as a whole if the send fails.
struct SendTransaction {
    prior_timeline: Timeline,
    prior_input: String,
}

impl SendTransaction {
    fn begin(timeline: &Timeline, input: &str) -> Self {
        Self {
            prior_timeline: timeline.clone(),
            prior_input: input.to_string(),
        }
    }

    fn roll_back(self, state: &mut EngineState) {
        state.timeline = self.prior_timeline;
        state.input = self.prior_input;
    }

    fn commit(self) {}
}

/// Counts an in-flight fetch, including one dropped by a cancelled refresh.
struct LoadingGuard<'a>(&'a ChatEngine);

impl<'a> LoadingGuard<'a> {
    fn enter(engine: &'a ChatEngine) -> Self {
        engine.state().loading += 1;
        Self(engine)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.0.state();
        st.loading = st.loading.saturating_sub(1);
    }
}

/// Returns the engine to `Idle` if a send future is dropped mid-cycle.
///
/// Before any reply text arrived the send is rolled back to its snapshot;
/// after that the partial reply is kept as a truncation. The cache is then
/// marked stale and the next send or page fetch refetches it first.
struct CycleGuard<'a> {
    engine: &'a ChatEngine,
    tx: Option<SendTransaction>,
    settled: bool,
    armed: bool,
}

impl<'a> CycleGuard<'a> {
    fn new(engine: &'a ChatEngine, tx: SendTransaction) -> Self {
        Self {
            engine,
            tx: Some(tx),
            settled: false,
            armed: true,
        }
    }

    fn take_tx(&mut self) -> Option<SendTransaction> {
        self.tx.take()
    }

    fn mark_settled(&mut self) {
        self.settled = true;
        if let Some(tx) = self.tx.take() {
            tx.commit();
        }
    }

    fn finish(mut self) {
        self.armed = false;
        self.engine.state().phase = SendPhase::Idle;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let engine = self.engine;
        let mut st = engine.state();
        let event = if self.settled {
            None
        } else if let Some(reply) = st.timeline.placeholder().map(|p| p.text.clone()) {
            st.timeline.retire_placeholder();
            Some(ChatEvent::Settled {
                reply,
                truncated: true,
            })
        } else {
            if let Some(tx) = self.tx.take() {
                tx.roll_back(&mut st);
            }
            Some(ChatEvent::RolledBack {
                notice: "send was interrupted".to_string(),
            })
        };
        st.phase = SendPhase::Idle;
        st.generation += 1;
        st.stale = true;
        drop(st);
        warn!(document_id = %engine.document_id, "send abandoned mid-cycle");
        if let Some(event) = event {
            engine.emit(event);
        }
    }
}

pub struct ChatEngine {
    document_id: String,
    user_id: String,
    page_size: usize,
    transport: Arc<dyn ChatTransport>,
    history: Arc<dyn HistorySource>,
    state: Mutex<EngineState>,
    send_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatEngine {
    pub fn new(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        page_size: usize,
        transport: Arc<dyn ChatTransport>,
        history: Arc<dyn HistorySource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            document_id: document_id.into(),
            user_id: user_id.into(),
            page_size,
            transport,
            history,
            state: Mutex::new(EngineState {
                timeline: Timeline::new(),
                input: String::new(),
                phase: SendPhase::Idle,
                loading: 0,
                generation: 0,
                refresh: None,
                stale: false,
            }),
            send_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> SendPhase {
        self.state().phase
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading > 0
    }

    pub fn input(&self) -> String {
        self.state().input.clone()
    }

    pub fn set_input(&self, text: impl Into<String>) {
        self.state().input = text.into();
    }

    /// Messages oldest-first.
    pub fn timeline(&self) -> Vec<Message> {
        self.state()
            .timeline
            .chronological()
            .into_iter()
            .cloned()
            .collect()
    }

    /// A copy of the cached pages as they stand.
    pub fn snapshot(&self) -> Timeline {
        self.state().timeline.clone()
    }

    /// Whether an abandoned send left pages that have not been refetched yet.
    pub fn is_stale(&self) -> bool {
        self.state().stale
    }

    pub fn has_more(&self) -> bool {
        self.state().timeline.has_more()
    }

    fn page_request(&self, cursor: Option<String>) -> Result<PageRequest, ChatError> {
        PageRequest::new(Some(self.page_size), cursor).map_err(|e| ChatError::Store(e.to_string()))
    }

    async fn fetch(&self, cursor: Option<String>) -> Result<CachePage, ChatError> {
        let request = self.page_request(cursor)?;
        let _loading = LoadingGuard::enter(self);
        self.history
            .fetch_page(&self.document_id, &request)
            .await
            .map(CachePage::from)
            .map_err(|e| ChatError::Store(format!("{:#}", e)))
    }

    /// Re-read the newest `pages` pages from scratch.
    async fn refetch(&self, pages: usize) -> Result<Timeline, ChatError> {
        let mut fresh = Timeline::new();
        let mut cursor = None;
        for _ in 0..pages.max(1) {
            let page = self.fetch(cursor).await?;
            cursor = page.next_cursor.clone();
            fresh.push_page(page);
            if cursor.is_none() {
                break;
            }
        }
        Ok(fresh)
    }

    /// Install refetched pages unless a send started since `generation`.
    fn apply_refetch(&self, generation: u64, fresh: Timeline) -> bool {
        let mut st = self.state();
        if st.generation != generation || st.phase.in_flight() {
            debug!(document_id = %self.document_id, "discarding stale refetch");
            return false;
        }
        st.timeline = fresh;
        st.stale = false;
        drop(st);
        self.emit(ChatEvent::Refreshed);
        true
    }

    /// Load the newest page, replacing whatever is cached.
    pub async fn load(&self) -> Result<(), ChatError> {
        let generation = self.state().generation;
        let fresh = self.refetch(1).await?;
        self.apply_refetch(generation, fresh);
        Ok(())
    }

    /// Append the next older page. Returns `false` when history is exhausted.
    pub async fn fetch_next_page(&self) -> Result<bool, ChatError> {
        if self.is_stale() {
            self.invalidate().await?;
        }
        let Some(cursor) = self.state().timeline.next_cursor().map(str::to_string) else {
            return Ok(false);
        };
        let page = self.fetch(Some(cursor.clone())).await?;

        let mut st = self.state();
        // Optimistic writes never touch cursors, so the page still fits
        // unless a refetch replaced the tail meanwhile.
        if st.timeline.next_cursor() != Some(cursor.as_str()) {
            return Ok(true);
        }
        st.timeline.push_page(page);
        Ok(true)
    }

    /// Refetch every loaded page now.
    pub async fn invalidate(&self) -> Result<(), ChatError> {
        let (generation, pages) = {
            let st = self.state();
            (st.generation, st.timeline.page_count())
        };
        match self.refetch(pages).await {
            Ok(fresh) => {
                self.apply_refetch(generation, fresh);
                Ok(())
            }
            Err(e) => {
                let err = ChatError::StaleCache(e.to_string());
                warn!(document_id = %self.document_id, error = %err, "invalidation failed");
                Err(err)
            }
        }
    }

    /// Refetch loaded pages in the background.
    ///
    /// Starting a send cancels the refresh; a result that arrives after a
    /// send began is dropped.
    pub fn refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let token = CancellationToken::new();
        let (generation, pages) = {
            let mut st = self.state();
            if let Some(previous) = st.refresh.replace(token.clone()) {
                previous.cancel();
            }
            (st.generation, st.timeline.page_count())
        };

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(document_id = %engine.document_id, "refresh cancelled");
                }
                result = engine.refetch(pages) => match result {
                    Ok(fresh) if !token.is_cancelled() => {
                        engine.apply_refetch(generation, fresh);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(document_id = %engine.document_id, error = %e, "refresh failed"),
                },
            }
        })
    }

    /// Set the input and send it.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<SendOutcome, ChatError> {
        self.set_input(text);
        self.send().await
    }

    /// Send the current input.
    ///
    /// The input is captured and cleared immediately. On a transport failure
    /// the timeline and input are restored exactly and the error is returned
    /// once; the engine is then idle again.
    pub async fn send(&self) -> Result<SendOutcome, ChatError> {
        let text = {
            let mut st = self.state();
            if st.input.trim().is_empty() {
                return Ok(SendOutcome::Ignored);
            }
            std::mem::take(&mut st.input)
        };

        let _turn = self.send_lock.lock().await;
        if self.is_stale() {
            let _ = self.invalidate().await;
        }

        let tx = {
            let mut st = self.state();
            if let Some(token) = st.refresh.take() {
                token.cancel();
                debug!(document_id = %self.document_id, "cancelled background refresh");
            }
            st.generation += 1;
            let tx = SendTransaction::begin(&st.timeline, &text);
            let message = Message::user(&self.document_id, &self.user_id, text.clone());
            st.timeline.prepend_user_message(message.clone());
            st.phase = SendPhase::Sending;
            drop(st);
            self.emit(ChatEvent::UserMessage(message));
            tx
        };
        let mut cycle = CycleGuard::new(self, tx);
        debug!(document_id = %self.document_id, "message sent optimistically");

        let mut body = match self.transport.send(&self.document_id, &text).await {
            Ok(body) => body,
            Err(e) => {
                let err = ChatError::StreamTransport(format!("{:#}", e));
                if let Some(tx) = cycle.take_tx() {
                    self.roll_back(tx, &err);
                }
                cycle.mark_settled();
                let _ = self.invalidate().await;
                cycle.finish();
                return Err(err);
            }
        };
        self.state().phase = SendPhase::Streaming;

        let mut fold = ResponseFold::new();
        let mut truncated = false;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    let text = fold.push(&bytes).to_string();
                    self.apply_reply(text);
                }
                Err(e) => {
                    warn!(document_id = %self.document_id, error = %format!("{:#}", e), "reply stream ended early");
                    truncated = true;
                    break;
                }
            }
        }
        let reply = fold.finish();
        self.apply_reply(reply.clone());

        {
            let mut st = self.state();
            st.timeline.retire_placeholder();
            st.phase = SendPhase::Settled;
            st.generation += 1;
        }
        cycle.mark_settled();
        info!(document_id = %self.document_id, chars = reply.len(), truncated, "reply settled");
        self.emit(ChatEvent::Settled {
            reply: reply.clone(),
            truncated,
        });

        let _ = self.invalidate().await;
        cycle.finish();

        Ok(SendOutcome::Settled { reply, truncated })
    }

    fn apply_reply(&self, text: String) {
        if text.is_empty() {
            return;
        }
        let mut st = self.state();
        if st.timeline.placeholder().is_some_and(|p| p.text == text) {
            return;
        }
        st.timeline
            .apply_assistant_text(&self.document_id, &self.user_id, &text);
        drop(st);
        self.emit(ChatEvent::Reply { text });
    }

    fn roll_back(&self, tx: SendTransaction, err: &ChatError) {
        {
            let mut st = self.state();
            tx.roll_back(&mut st);
            st.phase = SendPhase::RolledBack;
            st.generation += 1;
        }
        warn!(document_id = %self.document_id, error = %err, "send rolled back");
        self.emit(ChatEvent::RolledBack {
            notice: err.to_string(),
        });
    }
}
