use crate::error::{ChatError, Result};
use crate::models::UserBlock;
use crate::schema::{self, USER_BLOCKS};
use nxs_backend::{row, Backend, Query};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct Blocks {
    backend: Arc<dyn Backend>,
}

impl Blocks {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Block `blocked_id`. Blocking twice is not an error.
    pub async fn block(&self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        if blocker_id == blocked_id {
            return Err(ChatError::validation("You cannot block yourself"));
        }
        let insert = self
            .backend
            .insert(
                USER_BLOCKS,
                vec![row([
                    ("blocker_id", json!(blocker_id)),
                    ("blocked_id", json!(blocked_id)),
                ])],
            )
            .await;
        match insert {
            Ok(_) => {
                tracing::info!("[Blocks] {} blocked {}", blocker_id, blocked_id);
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn unblock(&self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        self.backend
            .delete(
                USER_BLOCKS,
                &Query::new()
                    .eq("blocker_id", blocker_id)
                    .eq("blocked_id", blocked_id),
            )
            .await?;
        Ok(())
    }

    /// Whether `blocker_id` has blocked `blocked_id`.
    pub async fn has_blocked(&self, blocker_id: &str, blocked_id: &str) -> Result<bool> {
        let n = self
            .backend
            .count(
                USER_BLOCKS,
                &Query::new()
                    .eq("blocker_id", blocker_id)
                    .eq("blocked_id", blocked_id),
            )
            .await?;
        Ok(n > 0)
    }

    /// Whether either user has blocked the other. Self-blocks are never
    /// stored, so the pair filter only matches the two directions.
    pub async fn is_blocked(&self, a: &str, b: &str) -> Result<bool> {
        let n = self
            .backend
            .count(
                USER_BLOCKS,
                &Query::new()
                    .is_in("blocker_id", [a, b])
                    .is_in("blocked_id", [a, b]),
            )
            .await?;
        Ok(n > 0)
    }

    pub async fn blocked_by(&self, blocker_id: &str) -> Result<Vec<UserBlock>> {
        let rows = self
            .backend
            .select(
                USER_BLOCKS,
                &Query::new()
                    .eq("blocker_id", blocker_id)
                    .order("created_at", false),
            )
            .await?;
        schema::decode_rows(USER_BLOCKS, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::memory_backend;

    fn blocks() -> Blocks {
        Blocks::new(Arc::new(memory_backend()))
    }

    #[tokio::test]
    async fn test_block_is_symmetric_for_messaging() {
        let blocks = blocks();
        assert!(!blocks.is_blocked("a", "b").await.unwrap());
        blocks.block("a", "b").await.unwrap();
        assert!(blocks.is_blocked("a", "b").await.unwrap());
        assert!(blocks.is_blocked("b", "a").await.unwrap());
        assert!(blocks.has_blocked("a", "b").await.unwrap());
        assert!(!blocks.has_blocked("b", "a").await.unwrap());
        assert!(!blocks.is_blocked("a", "c").await.unwrap());
    }

    #[tokio::test]
    async fn test_block_twice_then_unblock() {
        let blocks = blocks();
        blocks.block("a", "b").await.unwrap();
        blocks.block("a", "b").await.unwrap();
        assert_eq!(blocks.blocked_by("a").await.unwrap().len(), 1);
        blocks.unblock("a", "b").await.unwrap();
        assert!(!blocks.is_blocked("a", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_cannot_block_self() {
        assert!(matches!(
            blocks().block("a", "a").await,
            Err(ChatError::Validation(_))
        ));
    }
}
