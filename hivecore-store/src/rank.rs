//! Rank index: a typed leaderboard facade over the sorted-set contract.
//!
//! Ranks are 1-based and higher scores rank earlier. Same-score entries
//! keep the order the underlying store assigns (ascending lexicographic on
//! the stringified member id); callers needing a deterministic tie-break
//! fold a secondary field into the score.

// Layer 1: Standard library
use std::sync::Arc;

// Layer 2: Third-party
use serde::{Deserialize, Serialize};

// Layer 3: Internal
use crate::contract::SortedSetStore;
use crate::error::StoreError;

/// One leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub member_id: String,
    /// 1-based rank; 1 is the best.
    pub rank: u64,
    pub score: f64,
}

/// Keyed leaderboards over a [`SortedSetStore`].
///
/// Each `rank_type` (e.g. `"arena"`, `"guild_level"`) is an independent
/// board stored under the key `rank:{rank_type}`.
pub struct RankIndex {
    store: Arc<dyn SortedSetStore>,
}

impl RankIndex {
    pub fn new(store: Arc<dyn SortedSetStore>) -> Self {
        Self { store }
    }

    fn board_key(rank_type: &str) -> String {
        format!("rank:{rank_type}")
    }

    /// Insert or replace a member's score.
    pub async fn update(
        &self,
        rank_type: &str,
        member_id: &str,
        score: f64,
    ) -> Result<(), StoreError> {
        self.store
            .add(&Self::board_key(rank_type), member_id, score)
            .await
    }

    /// Add `delta` to a member's score and return the new score.
    pub async fn increment(
        &self,
        rank_type: &str,
        member_id: &str,
        delta: f64,
    ) -> Result<f64, StoreError> {
        self.store
            .increment_by(&Self::board_key(rank_type), member_id, delta)
            .await
    }

    pub async fn score(
        &self,
        rank_type: &str,
        member_id: &str,
    ) -> Result<Option<f64>, StoreError> {
        self.store.score(&Self::board_key(rank_type), member_id).await
    }

    /// 1-based rank, or -1 when the member is not on the board.
    pub async fn rank(&self, rank_type: &str, member_id: &str) -> Result<i64, StoreError> {
        Ok(self
            .store
            .rank_desc(&Self::board_key(rank_type), member_id)
            .await?
            .map(|r| r as i64 + 1)
            .unwrap_or(-1))
    }

    /// The best `n` entries.
    pub async fn top(&self, rank_type: &str, n: u64) -> Result<Vec<RankEntry>, StoreError> {
        self.range(rank_type, 0, n).await
    }

    /// Entries for store positions `[start, end)` (0-based), returned with
    /// their 1-based ranks.
    pub async fn range(
        &self,
        rank_type: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<RankEntry>, StoreError> {
        let rows = self
            .store
            .range_desc_with_scores(&Self::board_key(rank_type), start, end)
            .await?;
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(offset, (member_id, score))| RankEntry {
                member_id,
                rank: start + offset as u64 + 1,
                score,
            })
            .collect())
    }

    /// The window of `span` entries on each side of a member, the member
    /// included. Empty when the member is not on the board.
    pub async fn nearby(
        &self,
        rank_type: &str,
        member_id: &str,
        span: u64,
    ) -> Result<Vec<RankEntry>, StoreError> {
        let Some(position) = self
            .store
            .rank_desc(&Self::board_key(rank_type), member_id)
            .await?
        else {
            return Ok(Vec::new());
        };
        let start = position.saturating_sub(span);
        self.range(rank_type, start, position + span + 1).await
    }

    pub async fn size(&self, rank_type: &str) -> Result<u64, StoreError> {
        self.store.cardinality(&Self::board_key(rank_type)).await
    }

    /// Remove every entry on the board.
    pub async fn clear(&self, rank_type: &str) -> Result<(), StoreError> {
        let key = Self::board_key(rank_type);
        self.store.remove_range_desc(&key, 0, u64::MAX).await?;
        Ok(())
    }

    /// Keep the best `keep` entries, dropping the rest. Returns how many
    /// entries were removed.
    pub async fn trim(&self, rank_type: &str, keep: u64) -> Result<u64, StoreError> {
        self.store
            .remove_range_desc(&Self::board_key(rank_type), keep, u64::MAX)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;
    use crate::memory::MemorySortedSet;

    fn index() -> RankIndex {
        RankIndex::new(Arc::new(MemorySortedSet::new()))
    }

    async fn seed(index: &RankIndex) {
        for (member, score) in [("p1", 10.0), ("p2", 50.0), ("p3", 30.0), ("p4", 20.0)] {
            index.update("arena", member, score).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rank_is_one_based_desc() {
        let index = index();
        seed(&index).await;
        assert_eq!(index.rank("arena", "p2").await.unwrap(), 1);
        assert_eq!(index.rank("arena", "p3").await.unwrap(), 2);
        assert_eq!(index.rank("arena", "p1").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_missing_member_ranks_negative_one() {
        let index = index();
        seed(&index).await;
        assert_eq!(index.rank("arena", "ghost").await.unwrap(), -1);
        assert_eq!(index.rank("empty_board", "p1").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_top_carries_ranks() {
        let index = index();
        seed(&index).await;
        let top = index.top("arena", 2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].member_id, "p2");
        assert_eq!(top[0].rank, 1);
        assert_eq!(top[1].member_id, "p3");
        assert_eq!(top[1].rank, 2);
    }

    #[tokio::test]
    async fn test_range_translates_positions() {
        let index = index();
        seed(&index).await;
        let page = index.range("arena", 1, 3).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].rank, 2);
        assert_eq!(page[1].rank, 3);
    }

    #[tokio::test]
    async fn test_nearby_window_clamps_at_top() {
        let index = index();
        seed(&index).await;
        let window = index.nearby("arena", "p3", 1).await.unwrap();
        let members: Vec<&str> = window.iter().map(|e| e.member_id.as_str()).collect();
        assert_eq!(members, vec!["p2", "p3", "p4"]);

        // Member at rank 1: the window starts at the top.
        let window = index.nearby("arena", "p2", 2).await.unwrap();
        assert_eq!(window[0].rank, 1);
    }

    #[tokio::test]
    async fn test_nearby_missing_member_is_empty() {
        let index = index();
        seed(&index).await;
        assert!(index.nearby("arena", "ghost", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_increment_returns_new_score() {
        let index = index();
        seed(&index).await;
        assert_eq!(index.increment("arena", "p1", 90.0).await.unwrap(), 100.0);
        assert_eq!(index.rank("arena", "p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_trim_keeps_best() {
        let index = index();
        seed(&index).await;
        assert_eq!(index.trim("arena", 2).await.unwrap(), 2);
        assert_eq!(index.size("arena").await.unwrap(), 2);
        assert_eq!(index.rank("arena", "p1").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_clear_empties_board() {
        let index = index();
        seed(&index).await;
        index.clear("arena").await.unwrap();
        assert_eq!(index.size("arena").await.unwrap(), 0);
    }
}
