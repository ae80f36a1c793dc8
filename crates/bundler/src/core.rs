use crate::config::Config;
use crate::credit::CreditService;
use arweave::{Gateway, Wallet};
use blobs::BlobStore;
use cache::Cache;
use jobs::JobQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cached Arweave chain height, refreshed in the background so the
/// admission path never blocks on the gateway for a deadline height.
#[derive(Debug, Clone, Default)]
pub struct ChainHeight(Arc<AtomicU64>);

impl ChainHeight {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, height: u64) {
        self.0.store(height, Ordering::Relaxed);
    }
}

/// The single dependency-injection value threaded through the API and the
/// workers: one handle per external collaborator, selected at construction.
pub struct Core {
    pub config: Config,
    pub pool: sqlx::PgPool,
    pub blobs: BlobStore,
    pub cache: Arc<dyn Cache>,
    pub jobs: JobQueue,
    pub gateway: Gateway,
    pub credit: Arc<dyn CreditService>,
    pub wallet: Wallet,
    pub http: reqwest::Client,
    pub height: ChainHeight,
}

impl Core {
    pub fn build(
        config: Config,
        pool: sqlx::PgPool,
        blobs: BlobStore,
        cache: Arc<dyn Cache>,
        credit: Arc<dyn CreditService>,
        wallet: Wallet,
    ) -> anyhow::Result<Arc<Self>> {
        use anyhow::Context;

        let gateway = Gateway::new(config.gateway_url.clone()).context("building gateway client")?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building http client")?;
        let jobs = JobQueue::new(pool.clone());

        Ok(Arc::new(Self {
            config,
            pool,
            blobs,
            cache,
            jobs,
            gateway,
            credit,
            wallet,
            http,
            height: ChainHeight::default(),
        }))
    }

    /// Periodically refresh the cached chain height until `shutdown`.
    pub async fn refresh_height(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) {
        let mut ticks = tokio::time::interval(std::time::Duration::from_secs(57));
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => return,
                _ = ticks.tick() => {}
            }
            match self.gateway.current_height().await {
                Ok(height) => self.height.set(height),
                Err(err) => {
                    tracing::warn!(?err, "failed to refresh chain height");
                }
            }
        }
    }
}
