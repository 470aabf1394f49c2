//! Session storage.
//!
//! A session persists conversation items across runs. The loop writes a
//! baseline record of the original input before turn 1 and appends the items
//! of every turn before each transition, so interrupted runs leave a
//! consistent history behind.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::Result;
use crate::items::{ItemHelpers, Message, RunItem};

/// Interface for session storage implementations.
#[async_trait]
pub trait Session: Send + Sync + Debug {
    /// Unique identifier for the session.
    fn session_id(&self) -> &str;

    /// Retrieve items, oldest first. With a limit, the most recent `limit`
    /// items are returned, still oldest first.
    async fn get_items(&self, limit: Option<usize>) -> Result<Vec<RunItem>>;

    /// Append items to the session.
    async fn add_items(&self, items: Vec<RunItem>) -> Result<()>;

    /// Remove and return the most recent item.
    async fn pop_item(&self) -> Result<Option<RunItem>>;

    /// Delete every item in the session.
    async fn clear_session(&self) -> Result<()>;

    /// Conversation history as model-input messages.
    async fn get_messages(&self, limit: Option<usize>) -> Result<Vec<Message>> {
        let items = self.get_items(limit).await?;
        Ok(ItemHelpers::to_messages(&items))
    }
}

/// Merges stored history with structured (non-string) run input. Required
/// whenever a run starts from a message list and a session is attached;
/// string input merges as history followed by the new user message without
/// one.
#[async_trait]
pub trait SessionInputCallback: Send + Sync {
    async fn merge(&self, history: Vec<Message>, new_input: Vec<Message>) -> Result<Vec<Message>>;
}

/// Process-local session store, useful for tests and short-lived tools.
#[derive(Debug)]
pub struct InMemorySession {
    session_id: String,
    items: tokio::sync::Mutex<Vec<RunItem>>,
}

impl InMemorySession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            items: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Session for InMemorySession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn get_items(&self, limit: Option<usize>) -> Result<Vec<RunItem>> {
        let items = self.items.lock().await;
        match limit {
            Some(limit) => {
                let start = items.len().saturating_sub(limit);
                Ok(items[start..].to_vec())
            }
            None => Ok(items.clone()),
        }
    }

    async fn add_items(&self, new_items: Vec<RunItem>) -> Result<()> {
        self.items.lock().await.extend(new_items);
        Ok(())
    }

    async fn pop_item(&self) -> Result<Option<RunItem>> {
        Ok(self.items.lock().await.pop())
    }

    async fn clear_session(&self) -> Result<()> {
        self.items.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::Role;

    #[tokio::test]
    async fn test_in_memory_session_roundtrip() {
        let session = InMemorySession::new("local");
        assert_eq!(session.session_id(), "local");

        session
            .add_items(vec![
                RunItem::message(Role::User, "Hello"),
                RunItem::message(Role::Assistant, "Hi there!"),
            ])
            .await
            .unwrap();

        let items = session.get_items(None).await.unwrap();
        assert_eq!(items.len(), 2);

        let messages = session.get_messages(None).await.unwrap();
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_in_memory_session_limit_returns_most_recent() {
        let session = InMemorySession::new("local");
        for i in 0..5 {
            session
                .add_items(vec![RunItem::message(Role::User, format!("Message {}", i))])
                .await
                .unwrap();
        }

        let limited = session.get_items(Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        if let RunItem::Message(msg) = &limited[0] {
            assert_eq!(msg.content, "Message 3");
        } else {
            panic!("expected message item");
        }
    }

    #[tokio::test]
    async fn test_in_memory_session_pop_and_clear() {
        let session = InMemorySession::new("local");
        session
            .add_items(vec![
                RunItem::message(Role::User, "First"),
                RunItem::message(Role::User, "Second"),
            ])
            .await
            .unwrap();

        let popped = session.pop_item().await.unwrap();
        assert!(matches!(popped, Some(RunItem::Message(m)) if m.content == "Second"));

        session.clear_session().await.unwrap();
        assert!(session.get_items(None).await.unwrap().is_empty());
        assert!(session.pop_item().await.unwrap().is_none());
    }
}
