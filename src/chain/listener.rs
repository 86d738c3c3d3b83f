//! New-head listener with HTTP polling

use super::EthProvider;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Polls for new heads and publishes them through the provider's block cache
pub struct BlockListener {
    provider: Arc<EthProvider>,
    poll_interval: Duration,
    /// Last published block
    last_block: RwLock<Option<u64>>,
    shutdown: watch::Sender<bool>,
}

impl BlockListener {
    pub fn new(provider: Arc<EthProvider>, poll_interval: Duration) -> Self {
        Self {
            provider,
            poll_interval,
            last_block: RwLock::new(None),
            shutdown: watch::channel(false).0,
        }
    }

    /// Main polling loop
    pub async fn listen(&self) {
        info!("Polling chain {} for new blocks", self.provider.chain_id());

        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,

                _ = self.poll_and_wait() => {}
            }
        }

        info!("Block listener stopped");
    }

    async fn poll_and_wait(&self) {
        if let Err(e) = self.poll_once().await {
            warn!("Block poll failed: {}", e);
        }

        tokio::time::sleep(self.poll_interval).await;
    }

    /// Fetch the current head and publish it if it is new
    ///
    /// Only the head is published; skipped heights show up to the supervisor
    /// as a gap between `old` and `new`.
    async fn poll_once(&self) -> crate::error::KeeperResult<()> {
        let current = self.provider.get_block_number().await?;
        let last = *self.last_block.read().await;

        if last.is_some_and(|last| current <= last) {
            return Ok(());
        }

        match self.provider.get_block(current).await? {
            Some(block) => {
                debug!(
                    "Chain {}: new block {} with {} transactions",
                    self.provider.chain_id(),
                    block.number,
                    block.transactions.len()
                );
                *self.last_block.write().await = Some(block.number);
                self.provider.publish_block(block);
            }
            None => {
                debug!("Block {} not available yet", current);
            }
        }

        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    #[tokio::test]
    async fn test_stop_interrupts_poll_interval() {
        let provider = EthProvider::new(NetworkConfig {
            chain_id: 1,
            rpc_urls: vec!["http://127.0.0.1:1".to_string()],
            poll_interval_ms: 1000,
        })
        .unwrap();
        let listener = Arc::new(BlockListener::new(
            Arc::new(provider),
            Duration::from_secs(3600),
        ));

        let handle = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.listen().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener should stop without waiting out the interval")
            .unwrap();
    }
}
