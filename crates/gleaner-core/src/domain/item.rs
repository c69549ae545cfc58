//! Items fetched from the content source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A post (top-level) or a reply (child, `parent_id` set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub id: String,
    /// `None` when the author account no longer exists.
    pub author: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub score: i64,
}

impl CandidateItem {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            author: None,
            title: None,
            body: String::new(),
            created_at,
            parent_id: None,
            score: 0,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn reply_to(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn author_or_deleted(&self) -> &str {
        self.author.as_deref().unwrap_or("[deleted]")
    }

    /// Title and body joined by a space, skipping whichever is empty.
    pub fn content(&self) -> String {
        match self.title.as_deref().filter(|t| !t.is_empty()) {
            Some(title) if self.body.is_empty() => title.to_string(),
            Some(title) => format!("{title} {}", self.body),
            None => self.body.clone(),
        }
    }
}
