//! Paginated message cache and its pure merge functions.
//!
//! A [`Timeline`] is the client-local view of one document's history: a
//! list of [`CachePage`]s where `pages[0]` is the most recent page and each
//! page stores its messages newest-first, exactly as the record store
//! returns them. Older pages are appended as the user scrolls back.
//!
//! Only the most recent page is ever mutated optimistically. Optimistic
//! writes never touch `next_cursor`, so the next server fetch continues from
//! the same record it would have without them.

use chrono::Utc;

use crate::models::{Message, MessageId, MessagePage};

/// One cached page of history, newest message first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}

impl From<MessagePage> for CachePage {
    fn from(page: MessagePage) -> Self {
        Self {
            messages: page.messages,
            next_cursor: page.next_cursor,
        }
    }
}

/// Outcome of merging streamed text into the placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderMerge {
    Inserted,
    Updated,
}

/// Write `text` into the assistant placeholder of `page`.
///
/// Inserts the placeholder at the front (newest position) if the page has
/// none, otherwise replaces its text in place. Applying the same text twice
/// is a no-op beyond the first application.
pub fn merge_assistant_text(
    page: &mut CachePage,
    document_id: &str,
    user_id: &str,
    text: &str,
) -> PlaceholderMerge {
    match page.messages.iter_mut().find(|m| m.id.is_placeholder()) {
        Some(existing) => {
            existing.text.clear();
            existing.text.push_str(text);
            PlaceholderMerge::Updated
        }
        None => {
            page.messages
                .insert(0, Message::assistant_placeholder(document_id, user_id, text));
            PlaceholderMerge::Inserted
        }
    }
}

/// Cached pages for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    pages: Vec<CachePage>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pages(pages: Vec<CachePage>) -> Self {
        Self { pages }
    }

    pub fn pages(&self) -> &[CachePage] {
        &self.pages
    }

    pub fn into_pages(self) -> Vec<CachePage> {
        self.pages
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|p| p.messages.is_empty())
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn message_count(&self) -> usize {
        self.pages.iter().map(|p| p.messages.len()).sum()
    }

    /// Append an older page fetched with the current cursor.
    pub fn push_page(&mut self, page: CachePage) {
        self.pages.push(page);
    }

    /// Cursor for the next older page; `None` once history is exhausted or
    /// nothing has been loaded.
    pub fn next_cursor(&self) -> Option<&str> {
        self.pages.last().and_then(|p| p.next_cursor.as_deref())
    }

    pub fn has_more(&self) -> bool {
        self.next_cursor().is_some()
    }

    /// Messages oldest-first, the order a transcript is read in.
    pub fn chronological(&self) -> Vec<&Message> {
        self.pages
            .iter()
            .rev()
            .flat_map(|p| p.messages.iter().rev())
            .collect()
    }

    pub fn find(&self, id: &MessageId) -> Option<&Message> {
        self.pages
            .iter()
            .flat_map(|p| p.messages.iter())
            .find(|m| &m.id == id)
    }

    pub fn placeholder(&self) -> Option<&Message> {
        self.pages
            .first()
            .and_then(|p| p.messages.iter().find(|m| m.id.is_placeholder()))
    }

    /// Optimistically add a user message as the newest entry.
    ///
    /// With nothing loaded yet, a first page is created with no cursor.
    pub fn prepend_user_message(&mut self, message: Message) {
        match self.pages.first_mut() {
            Some(page) => page.messages.insert(0, message),
            None => self.pages.push(CachePage {
                messages: vec![message],
                next_cursor: None,
            }),
        }
    }

    /// Merge the accumulated assistant text into the most recent page.
    pub fn apply_assistant_text(
        &mut self,
        document_id: &str,
        user_id: &str,
        text: &str,
    ) -> PlaceholderMerge {
        if self.pages.is_empty() {
            self.pages.push(CachePage::default());
        }
        merge_assistant_text(&mut self.pages[0], document_id, user_id, text)
    }

    /// Give the settled placeholder a unique local id so the sentinel is
    /// free for the next reply. Returns the id it now carries.
    pub fn retire_placeholder(&mut self) -> Option<MessageId> {
        let page = self.pages.first_mut()?;
        let placeholder = page.messages.iter_mut().find(|m| m.id.is_placeholder())?;
        placeholder.id = MessageId::local();
        placeholder.created_at = placeholder.created_at.max(Utc::now());
        Some(placeholder.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(text: &str, id: &str) -> Message {
        let mut m = Message::user("doc", "u", text);
        m.id = MessageId::Committed(id.to_string());
        m
    }

    fn texts(t: &Timeline) -> Vec<String> {
        t.chronological().iter().map(|m| m.text.clone()).collect()
    }

    #[test]
    fn chronological_reverses_pages_and_messages() {
        let t = Timeline::from_pages(vec![
            CachePage {
                messages: vec![committed("4", "d"), committed("3", "c")],
                next_cursor: Some("b".into()),
            },
            CachePage {
                messages: vec![committed("2", "b"), committed("1", "a")],
                next_cursor: None,
            },
        ]);
        assert_eq!(texts(&t), ["1", "2", "3", "4"]);
        assert!(!t.has_more());
    }

    #[test]
    fn streamed_chunks_produce_one_placeholder() {
        let mut t = Timeline::new();
        t.prepend_user_message(Message::user("doc", "u", "question"));
        let mut acc = String::new();
        let mut merges = Vec::new();
        for chunk in ["Hel", "lo", " world"] {
            acc.push_str(chunk);
            merges.push(t.apply_assistant_text("doc", "u", &acc));
        }
        assert_eq!(
            merges,
            [
                PlaceholderMerge::Inserted,
                PlaceholderMerge::Updated,
                PlaceholderMerge::Updated
            ]
        );
        let placeholders: Vec<_> = t
            .chronological()
            .into_iter()
            .filter(|m| m.id.is_placeholder())
            .collect();
        assert_eq!(placeholders.len(), 1);
        assert_eq!(placeholders[0].text, "Hello world");
        assert_eq!(texts(&t), ["question", "Hello world"]);
    }

    #[test]
    fn reapplying_same_text_is_idempotent() {
        let mut t = Timeline::new();
        t.apply_assistant_text("doc", "u", "abc");
        let once = t.clone();
        t.apply_assistant_text("doc", "u", "abc");
        assert_eq!(t, once);
    }

    #[test]
    fn optimistic_insert_keeps_cursor() {
        let mut t = Timeline::from_pages(vec![CachePage {
            messages: vec![committed("old", "x")],
            next_cursor: Some("w".into()),
        }]);
        t.prepend_user_message(Message::user("doc", "u", "new"));
        assert_eq!(t.next_cursor(), Some("w"));
        assert_eq!(texts(&t), ["old", "new"]);
    }

    #[test]
    fn retired_placeholder_frees_sentinel() {
        let mut t = Timeline::new();
        t.prepend_user_message(Message::user("doc", "u", "q1"));
        t.apply_assistant_text("doc", "u", "a1");
        let retired = t.retire_placeholder().unwrap();
        assert!(!retired.is_placeholder());
        assert!(t.placeholder().is_none());

        t.prepend_user_message(Message::user("doc", "u", "q2"));
        assert_eq!(t.apply_assistant_text("doc", "u", "a2"), PlaceholderMerge::Inserted);
        assert_eq!(texts(&t), ["q1", "a1", "q2", "a2"]);
    }

    #[test]
    fn placeholder_only_searched_in_latest_page() {
        let stale = Message::assistant_placeholder("doc", "u", "stale");
        let mut t = Timeline::from_pages(vec![
            CachePage::default(),
            CachePage {
                messages: vec![stale],
                next_cursor: None,
            },
        ]);
        assert_eq!(t.apply_assistant_text("doc", "u", "fresh"), PlaceholderMerge::Inserted);
        assert_eq!(t.pages()[0].messages[0].text, "fresh");
    }
}
