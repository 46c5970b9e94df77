//! Reply trees stored flat: every comment is a node keyed by id with a
//! back-reference to its parent. Children are fetched one level at a time,
//! so a node's child list stays `None` until its replies are loaded.
//!
//! A reply is only accepted under a parent that is already present and
//! strictly older, so the parent chain can never loop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use plaza_types::models::Comment;

use crate::api::CommentApi;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone)]
pub struct CommentNode {
    pub comment: Comment,
    pub children: Option<Vec<Uuid>>,
}

#[derive(Debug, Default)]
pub struct CommentTree {
    nodes: HashMap<Uuid, CommentNode>,
    /// Top-level comment ids per post, present once loaded.
    roots: HashMap<Uuid, Vec<Uuid>>,
}

impl CommentTree {
    pub fn get(&self, id: Uuid) -> Option<&CommentNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn collect(&self, ids: &[Uuid]) -> Vec<Comment> {
        ids.iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|node| node.comment.clone())
            .collect()
    }

    pub fn roots(&self, post_id: Uuid) -> Option<Vec<Comment>> {
        self.roots.get(&post_id).map(|ids| self.collect(ids))
    }

    pub fn children(&self, id: Uuid) -> Option<Vec<Comment>> {
        let ids = self.nodes.get(&id)?.children.as_ref()?;
        Some(self.collect(ids))
    }

    /// Insert one comment. Returns false for an id already present.
    pub fn insert(&mut self, comment: Comment) -> SyncResult<bool> {
        if self.nodes.contains_key(&comment.id) {
            return Ok(false);
        }

        if let Some(parent_id) = comment.parent_id {
            let valid = self.nodes.get(&parent_id).is_some_and(|p| {
                p.comment.post_id == comment.post_id && p.comment.created_at < comment.created_at
            });
            if !valid {
                return Err(SyncError::InvalidReply {
                    reply: comment.id,
                    parent: parent_id,
                });
            }
        }

        let id = comment.id;
        let post_id = comment.post_id;
        let parent_id = comment.parent_id;
        self.nodes.insert(
            id,
            CommentNode {
                comment,
                children: None,
            },
        );

        let loaded = match parent_id {
            Some(parent_id) => self
                .nodes
                .get_mut(&parent_id)
                .and_then(|p| p.children.take()),
            None => self.roots.remove(&post_id),
        };
        if let Some(mut siblings) = loaded {
            siblings.push(id);
            sort_by_age(&mut siblings, &self.nodes);
            match parent_id {
                Some(parent_id) => {
                    if let Some(parent) = self.nodes.get_mut(&parent_id) {
                        parent.children = Some(siblings);
                    }
                }
                None => {
                    self.roots.insert(post_id, siblings);
                }
            }
        }
        Ok(true)
    }

    /// Install the top level of a post. Invalid entries are skipped.
    pub fn set_roots(&mut self, post_id: Uuid, comments: Vec<Comment>) -> usize {
        self.roots.entry(post_id).or_default();
        self.insert_level(comments.into_iter().filter(|c| c.parent_id.is_none()))
    }

    /// Install one level of replies under `parent_id`.
    pub fn set_replies(&mut self, parent_id: Uuid, comments: Vec<Comment>) -> SyncResult<usize> {
        let parent = self
            .nodes
            .get_mut(&parent_id)
            .ok_or(SyncError::UnknownEntity(parent_id))?;
        if parent.children.is_none() {
            parent.children = Some(Vec::new());
        }
        Ok(self.insert_level(
            comments
                .into_iter()
                .filter(|c| c.parent_id == Some(parent_id)),
        ))
    }

    fn insert_level(&mut self, comments: impl Iterator<Item = Comment>) -> usize {
        let mut added = 0;
        for comment in comments {
            match self.insert(comment) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => warn!("Skipping comment: {}", e),
            }
        }
        added
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }
}

fn sort_by_age(ids: &mut [Uuid], nodes: &HashMap<Uuid, CommentNode>) {
    ids.sort_by_key(|id| nodes.get(id).map(|n| n.comment.created_at));
}

#[derive(Clone)]
pub struct CommentSynchronizer {
    inner: Arc<CommentInner>,
}

struct CommentInner {
    api: Arc<dyn CommentApi>,
    tree: Mutex<CommentTree>,
    changes: watch::Sender<u64>,
}

impl CommentSynchronizer {
    pub fn new(api: Arc<dyn CommentApi>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(CommentInner {
                api,
                tree: Mutex::new(CommentTree::default()),
                changes,
            }),
        }
    }

    pub async fn load_roots(&self, post_id: Uuid) -> SyncResult<usize> {
        let comments = self.inner.api.list_comments(post_id, None).await?;
        let added = self.inner.tree.lock().set_roots(post_id, comments);
        debug!("Loaded {} top-level comments for post {}", added, post_id);
        self.notify();
        Ok(added)
    }

    pub async fn load_replies(&self, comment_id: Uuid) -> SyncResult<usize> {
        let post_id = self
            .inner
            .tree
            .lock()
            .get(comment_id)
            .map(|node| node.comment.post_id)
            .ok_or(SyncError::UnknownEntity(comment_id))?;

        let replies = self.inner.api.list_comments(post_id, Some(comment_id)).await?;
        let added = self.inner.tree.lock().set_replies(comment_id, replies)?;
        self.notify();
        Ok(added)
    }

    /// Add a comment the viewer just posted.
    pub fn insert(&self, comment: Comment) -> SyncResult<bool> {
        let inserted = self.inner.tree.lock().insert(comment)?;
        if inserted {
            self.notify();
        }
        Ok(inserted)
    }

    pub fn roots(&self, post_id: Uuid) -> Option<Vec<Comment>> {
        self.inner.tree.lock().roots(post_id)
    }

    pub fn children(&self, comment_id: Uuid) -> Option<Vec<Comment>> {
        self.inner.tree.lock().children(comment_id)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn clear(&self) {
        self.inner.tree.lock().clear();
        self.notify();
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }
}
