use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Indexer;

/// Background poller publishing the indexer's chain tip
pub struct HeaderWatcher;

/// Cancels the watcher task when stopped or dropped
pub struct HeaderWatcherHandle {
    task: JoinHandle<()>,
}

impl HeaderWatcherHandle {
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for HeaderWatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl HeaderWatcher {
    /// Poll `indexer` every `interval`, sending each new tip height
    ///
    /// The receiver starts at `None`. The task ends on its own once every
    /// receiver is gone.
    pub fn spawn(
        indexer: Arc<dyn Indexer>,
        interval: Duration,
    ) -> (watch::Receiver<Option<u32>>, HeaderWatcherHandle) {
        let (sender, receiver) = watch::channel(None);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match indexer.tip_height().await {
                    Ok(height) => {
                        let changed = sender.send_if_modified(|current| {
                            if *current == Some(height) {
                                false
                            } else {
                                *current = Some(height);
                                true
                            }
                        });
                        if changed {
                            log::debug!("📡 New chain tip at height {}", height);
                        }
                    }
                    Err(e) => log::warn!("⚠️  Header poll failed: {}", e),
                }

                if sender.is_closed() {
                    log::debug!("All header receivers gone, stopping watcher");
                    return;
                }
            }
        });

        (receiver, HeaderWatcherHandle { task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{HistoryItem, IndexerError, UnspentItem};
    use async_trait::async_trait;
    use bitcoin::{Transaction, Txid};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTip(AtomicU32);

    #[async_trait]
    impl Indexer for CountingTip {
        async fn tip_height(&self) -> Result<u32, IndexerError> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst) / 2)
        }
        async fn get_history(&self, _: &str) -> Result<Vec<HistoryItem>, IndexerError> {
            Ok(Vec::new())
        }
        async fn get_unspent(&self, _: &str) -> Result<Vec<UnspentItem>, IndexerError> {
            Ok(Vec::new())
        }
        async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, IndexerError> {
            Err(IndexerError::MalformedResponse(txid.to_string()))
        }
        async fn broadcast(&self, _: &Transaction) -> Result<Txid, IndexerError> {
            Err(IndexerError::Rejected("read only".to_string()))
        }
        async fn estimate_fee(&self, _: u16) -> Result<Option<u64>, IndexerError> {
            Ok(None)
        }
        async fn block_time(&self, _: u32) -> Result<u64, IndexerError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_publishes_new_heights_until_stopped() {
        let indexer = Arc::new(CountingTip(AtomicU32::new(0)));
        let (mut heights, handle) = HeaderWatcher::spawn(indexer, Duration::from_millis(5));

        heights.changed().await.unwrap();
        assert_eq!(*heights.borrow_and_update(), Some(0));
        heights.changed().await.unwrap();
        assert_eq!(*heights.borrow_and_update(), Some(1));

        handle.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_finished());
    }
}
