use anyhow::Context;
use futures::future::try_join_all;
use serde_json::Value;

use crate::agent::block::{format_block, FormatError};
use crate::agent::types::{BlockRecord, StatsSnapshot};
use crate::core::clients::rpc::RpcClient;

#[derive(Debug, PartialEq)]
pub enum BlockOutcome {
    Invalid(FormatError),
    /// Same number and same content as the current block
    Duplicate(u64),
    Applied {
        number: u64,
        /// Same number as the current block but different content
        replaced: bool,
        /// Block numbers to backfill, ascending
        backfill: Option<Vec<u64>>,
    },
}

///
/// Applies new heads to the snapshot and works out which blocks are missing when
/// the head jumps. The highest head seen survives reconnects.
///
pub struct BlockWatcher {
    last_seen_head: Option<u64>,
    max_blocks_history: u64,
    max_history_update: u64,
    history_enabled: bool,
}

impl BlockWatcher {
    pub fn new(max_blocks_history: u64, max_history_update: u64, history_enabled: bool) -> Self {
        Self {
            last_seen_head: None,
            max_blocks_history,
            max_history_update,
            history_enabled,
        }
    }

    /// Highest head applied so far, `None` until the first block
    pub fn last_seen_head(&self) -> Option<u64> {
        self.last_seen_head
    }

    pub fn accept(&mut self, stats: &mut StatsSnapshot, raw: &Value) -> BlockOutcome {
        let block = match format_block(raw) {
            Ok(block) => block,
            Err(e) => return BlockOutcome::Invalid(e),
        };

        let replaced = block.number == stats.block.number;
        if replaced && same_content(&block, &stats.block) {
            return BlockOutcome::Duplicate(block.number);
        }

        let number = block.number;
        stats.block = block;

        let backfill = if self.history_enabled {
            backfill_range(
                self.last_seen_head.unwrap_or_default(),
                number,
                self.max_blocks_history,
            )
        } else {
            None
        };
        self.last_seen_head = Some(self.last_seen_head.map_or(number, |last| last.max(number)));

        BlockOutcome::Applied {
            number,
            replaced,
            backfill,
        }
    }

    /// Blocks sent for a history request that names none
    pub fn default_history_range(&self, head: u64) -> Vec<u64> {
        (head.saturating_sub(self.max_history_update)..head).collect()
    }

    /// Fetches `list` concurrently. One failed request fails the batch; blocks that
    /// fail to format are kept as `None`. The result is `list` reversed.
    pub async fn fetch_history(
        rpc: &dyn RpcClient,
        list: &[u64],
    ) -> anyhow::Result<Vec<Option<BlockRecord>>> {
        let raw = try_join_all(list.iter().map(|number| rpc.get_block_by_number(*number, true)))
            .await
            .context("Could not fetch history blocks")?;

        let mut history: Vec<Option<BlockRecord>> =
            raw.iter().map(|block| format_block(block).ok()).collect();
        history.reverse();
        Ok(history)
    }
}

fn same_content(a: &BlockRecord, b: &BlockRecord) -> bool {
    match (serde_json::to_string(a), serde_json::to_string(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Ascending gap between `last_seen` and `head`, bounded to `max` blocks
pub fn backfill_range(last_seen: u64, head: u64, max: u64) -> Option<Vec<u64>> {
    if head <= last_seen.saturating_add(1) {
        return None;
    }
    let start = head.saturating_sub(max).max(last_seen + 1);
    let range: Vec<u64> = (start..head).collect();
    (!range.is_empty()).then_some(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{raw_block, FakeRpc};

    #[test]
    fn test_backfill_range() {
        assert_eq!(backfill_range(100, 105, 40), Some(vec![101, 102, 103, 104]));
        assert_eq!(backfill_range(100, 101, 40), None);
        assert_eq!(backfill_range(100, 100, 40), None);
        assert_eq!(backfill_range(100, 90, 40), None);
        assert_eq!(backfill_range(100, 200, 3), Some(vec![197, 198, 199]));
        assert_eq!(backfill_range(0, 5, 40), Some(vec![1, 2, 3, 4]));
        assert_eq!(backfill_range(100, 105, 0), None);
    }

    #[test]
    fn test_accept_applies_and_backfills() {
        let mut watcher = BlockWatcher::new(40, 50, true);
        let mut stats = StatsSnapshot::default();
        assert_eq!(watcher.last_seen_head(), None);

        watcher.accept(&mut stats, &raw_block(100, "0xa"));
        let outcome = watcher.accept(&mut stats, &raw_block(105, "0xb"));
        assert_eq!(
            outcome,
            BlockOutcome::Applied {
                number: 105,
                replaced: false,
                backfill: Some(vec![101, 102, 103, 104]),
            }
        );
        assert_eq!(stats.block.number, 105);
        assert_eq!(watcher.last_seen_head(), Some(105));
    }

    #[test]
    fn test_accept_duplicates_and_replacements() {
        let mut watcher = BlockWatcher::new(40, 50, true);
        let mut stats = StatsSnapshot::default();

        watcher.accept(&mut stats, &raw_block(100, "0xa"));
        assert_eq!(
            watcher.accept(&mut stats, &raw_block(100, "0xa")),
            BlockOutcome::Duplicate(100)
        );
        assert_eq!(
            watcher.accept(&mut stats, &raw_block(100, "0xb")),
            BlockOutcome::Applied {
                number: 100,
                replaced: true,
                backfill: None,
            }
        );
        assert_eq!(stats.block.hash, "0xb");
    }

    #[test]
    fn test_accept_rejects_invalid_without_touching_state() {
        let mut watcher = BlockWatcher::new(40, 50, true);
        let mut stats = StatsSnapshot::default();
        watcher.accept(&mut stats, &raw_block(100, "0xa"));

        let outcome = watcher.accept(&mut stats, &Value::Null);
        assert_eq!(outcome, BlockOutcome::Invalid(FormatError::Null));
        assert_eq!(stats.block.number, 100);
        assert_eq!(watcher.last_seen_head(), Some(100));
    }

    #[test]
    fn test_lower_head_keeps_last_seen() {
        let mut watcher = BlockWatcher::new(40, 50, true);
        let mut stats = StatsSnapshot::default();
        watcher.accept(&mut stats, &raw_block(100, "0xa"));
        watcher.accept(&mut stats, &raw_block(98, "0xc"));
        assert_eq!(stats.block.number, 98);
        assert_eq!(watcher.last_seen_head(), Some(100));
    }

    #[test]
    fn test_history_disabled_skips_backfill() {
        let mut watcher = BlockWatcher::new(40, 50, false);
        let mut stats = StatsSnapshot::default();
        watcher.accept(&mut stats, &raw_block(100, "0xa"));
        assert!(matches!(
            watcher.accept(&mut stats, &raw_block(110, "0xb")),
            BlockOutcome::Applied { backfill: None, .. }
        ));
    }

    #[test]
    fn test_default_history_range() {
        let watcher = BlockWatcher::new(40, 50, true);
        assert_eq!(watcher.default_history_range(200), (150..200).collect::<Vec<_>>());
        assert_eq!(watcher.default_history_range(3), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_fetch_history_newest_first() {
        let rpc = FakeRpc::new()
            .with_block(101, raw_block(101, "0x1"))
            .with_block(102, Value::Null)
            .with_block(103, raw_block(103, "0x3"));

        let history = BlockWatcher::fetch_history(&rpc, &[101, 102, 103]).await.unwrap();
        let numbers: Vec<Option<u64>> = history
            .iter()
            .map(|block| block.as_ref().map(|b| b.number))
            .collect();
        assert_eq!(numbers, vec![Some(103), None, Some(101)]);
    }

    #[tokio::test]
    async fn test_fetch_history_fails_as_a_batch() {
        let rpc = FakeRpc::new().with_block(101, raw_block(101, "0x1"));
        assert!(BlockWatcher::fetch_history(&rpc, &[101, 102]).await.is_err());
    }
}
