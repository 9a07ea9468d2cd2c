use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::logging::{log, obj, v_str, Domain, Level};

/// Where a post lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayTarget {
    /// An existing thread, typically a user's registered gallery.
    Thread(u64),
    /// A new thread in the named forum.
    Forum { forum: String, title: String },
}

/// Reference to a posted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayLocation {
    pub thread_id: u64,
    pub message_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostContent {
    pub headline: String,
    pub body: String,
}

impl PostContent {
    pub fn new(headline: impl Into<String>, body: impl Into<String>) -> Self {
        Self { headline: headline.into(), body: body.into() }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostError {
    /// The destination does not exist (deleted thread, unknown forum, ...).
    #[error("display target not found: {0}")]
    NotFound(String),
    #[error("transient display failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait GalleryPoster: Send + Sync {
    async fn post(
        &self,
        target: &DisplayTarget,
        content: &PostContent,
        image: Option<&Path>,
        listing_id: i64,
    ) -> Result<DisplayLocation, PostError>;

    async fn edit(&self, location: &DisplayLocation, content: &PostContent) -> Result<(), PostError>;

    async fn delete(&self, location: &DisplayLocation) -> Result<(), PostError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPost {
    pub message_id: u64,
    pub listing_id: i64,
    pub content: PostContent,
    pub has_image: bool,
}

/// In-process gallery used by the operator binary and tests. Threads and
/// forums must exist before they can be posted to; single failures can be
/// queued to exercise rollback paths.
#[derive(Debug, Default)]
pub struct MemoryGallery {
    forums: Mutex<HashSet<String>>,
    threads: Mutex<HashMap<u64, Vec<StoredPost>>>,
    next_id: AtomicU64,
    pending_failures: Mutex<Vec<PostError>>,
}

impl MemoryGallery {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1000), ..Default::default() }
    }

    /// Starts id allocation above `floor`, so ids recorded by an earlier
    /// process are never handed out again.
    pub fn ids_after(self, floor: u64) -> Self {
        let next = self.next_id.load(Ordering::SeqCst).max(floor.saturating_add(1));
        self.next_id.store(next, Ordering::SeqCst);
        self
    }

    pub fn with_forum(self, forum: &str) -> Self {
        if let Ok(mut forums) = self.forums.lock() {
            forums.insert(forum.to_string());
        }
        self
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn create_thread(&self) -> u64 {
        let id = self.next();
        if let Ok(mut threads) = self.threads.lock() {
            threads.insert(id, Vec::new());
        }
        id
    }

    pub fn remove_thread(&self, thread_id: u64) {
        if let Ok(mut threads) = self.threads.lock() {
            threads.remove(&thread_id);
        }
    }

    pub fn remove_forum(&self, forum: &str) {
        if let Ok(mut forums) = self.forums.lock() {
            forums.remove(forum);
        }
    }

    /// The next `post` call fails with `err`.
    pub fn fail_next_post(&self, err: PostError) {
        if let Ok(mut pending) = self.pending_failures.lock() {
            pending.push(err);
        }
    }

    pub fn posts(&self, thread_id: u64) -> Vec<StoredPost> {
        self.threads
            .lock()
            .ok()
            .and_then(|t| t.get(&thread_id).cloned())
            .unwrap_or_default()
    }

    pub fn post_exists(&self, location: &DisplayLocation) -> bool {
        self.posts(location.thread_id)
            .iter()
            .any(|p| p.message_id == location.message_id)
    }

    pub fn total_posts(&self) -> usize {
        self.threads
            .lock()
            .map(|t| t.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn take_failure(&self) -> Option<PostError> {
        self.pending_failures.lock().ok().and_then(|mut p| p.pop())
    }
}

#[async_trait]
impl GalleryPoster for MemoryGallery {
    async fn post(
        &self,
        target: &DisplayTarget,
        content: &PostContent,
        image: Option<&Path>,
        listing_id: i64,
    ) -> Result<DisplayLocation, PostError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let thread_id = match target {
            DisplayTarget::Thread(id) => *id,
            DisplayTarget::Forum { forum, .. } => {
                let known = self.forums.lock().map(|f| f.contains(forum)).unwrap_or(false);
                if !known {
                    return Err(PostError::NotFound(format!("forum {}", forum)));
                }
                self.create_thread()
            }
        };
        let message_id = self.next();
        let mut threads = self
            .threads
            .lock()
            .map_err(|_| PostError::Transient("gallery state poisoned".to_string()))?;
        let posts = threads
            .get_mut(&thread_id)
            .ok_or_else(|| PostError::NotFound(format!("thread {}", thread_id)))?;
        posts.push(StoredPost {
            message_id,
            listing_id,
            content: content.clone(),
            has_image: image.is_some(),
        });
        log(
            Level::Debug,
            Domain::Gallery,
            "post",
            obj(&[
                ("item_id", json!(listing_id)),
                ("thread_id", json!(thread_id)),
                ("message_id", json!(message_id)),
                ("headline", v_str(&content.headline)),
            ]),
        );
        Ok(DisplayLocation { thread_id, message_id })
    }

    async fn edit(&self, location: &DisplayLocation, content: &PostContent) -> Result<(), PostError> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|_| PostError::Transient("gallery state poisoned".to_string()))?;
        let post = threads
            .get_mut(&location.thread_id)
            .and_then(|posts| posts.iter_mut().find(|p| p.message_id == location.message_id))
            .ok_or_else(|| PostError::NotFound(format!("message {}", location.message_id)))?;
        post.content = content.clone();
        Ok(())
    }

    async fn delete(&self, location: &DisplayLocation) -> Result<(), PostError> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|_| PostError::Transient("gallery state poisoned".to_string()))?;
        let posts = threads
            .get_mut(&location.thread_id)
            .ok_or_else(|| PostError::NotFound(format!("thread {}", location.thread_id)))?;
        let before = posts.len();
        posts.retain(|p| p.message_id != location.message_id);
        if posts.len() == before {
            return Err(PostError::NotFound(format!("message {}", location.message_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forum_post_creates_thread() {
        let gallery = MemoryGallery::new().with_forum("gallery");
        let target = DisplayTarget::Forum { forum: "gallery".into(), title: "[A] x".into() };
        let loc = gallery
            .post(&target, &PostContent::new("h", "b"), None, 1)
            .await
            .unwrap();
        assert!(gallery.post_exists(&loc));
        assert_eq!(gallery.posts(loc.thread_id).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_targets_are_not_found() {
        let gallery = MemoryGallery::new();
        let forum = DisplayTarget::Forum { forum: "nope".into(), title: "t".into() };
        let err = gallery.post(&forum, &PostContent::default(), None, 1).await.unwrap_err();
        assert!(matches!(err, PostError::NotFound(_)));
        let err = gallery
            .post(&DisplayTarget::Thread(42), &PostContent::default(), None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PostError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let gallery = MemoryGallery::new();
        let thread = gallery.create_thread();
        gallery.fail_next_post(PostError::Transient("503".into()));
        let target = DisplayTarget::Thread(thread);
        assert!(gallery.post(&target, &PostContent::default(), None, 1).await.is_err());
        assert!(gallery.post(&target, &PostContent::default(), None, 1).await.is_ok());
    }

    #[test]
    fn test_ids_after_floor() {
        let gallery = MemoryGallery::new().ids_after(5000);
        assert_eq!(gallery.create_thread(), 5001);
        let low = MemoryGallery::new().ids_after(10);
        assert_eq!(low.create_thread(), 1000);
    }

    #[tokio::test]
    async fn test_edit_and_delete() {
        let gallery = MemoryGallery::new();
        let thread = gallery.create_thread();
        let loc = gallery
            .post(&DisplayTarget::Thread(thread), &PostContent::new("a", ""), None, 5)
            .await
            .unwrap();
        gallery.edit(&loc, &PostContent::new("b", "")).await.unwrap();
        assert_eq!(gallery.posts(thread)[0].content.headline, "b");
        gallery.delete(&loc).await.unwrap();
        assert!(matches!(gallery.delete(&loc).await, Err(PostError::NotFound(_))));
    }
}
