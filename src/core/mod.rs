//! Process composition root
//!
//! [`Core`] owns every managed resource: the bounded datastore pool, the
//! supervised cache link, and the optional payment/storage collaborators.
//! Fatal conditions surface through the [`Supervisor`] channel instead of
//! being handled in place, so the binary decides process fate in one spot.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ResourceConfig;
use crate::pool::{
    HealthMonitor, MonitorHandle, Pool, PoolSettings, PoolStats, SupervisorSignal, TcpManager,
};
use crate::services::{HttpPaymentProvider, S3Store, WebhookVerifier};

/// Receives fatal-condition signals from the pool and monitors
pub struct Supervisor {
    signals: mpsc::UnboundedReceiver<SupervisorSignal>,
}

impl Supervisor {
    /// Next fatal signal; `None` once every sender has shut down
    pub async fn next(&mut self) -> Option<SupervisorSignal> {
        self.signals.recv().await
    }
}

/// All managed resources for one process
pub struct Core {
    config: Arc<ResourceConfig>,
    database: Arc<Pool<TcpManager>>,
    cache: MonitorHandle<TcpManager>,
    storage: Option<S3Store>,
    payment: Option<HttpPaymentProvider>,
    webhooks: Option<WebhookVerifier>,
    shutdown: watch::Sender<bool>,
    monitor_task: JoinHandle<()>,
}

impl Core {
    /// Build every resource from `config` and start the cache monitor
    pub fn new(config: Arc<ResourceConfig>) -> anyhow::Result<(Self, Supervisor)> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let db = &config.database;
        let pool = Arc::new(Pool::new(
            TcpManager::new(db.addr(), db.connect_timeout),
            PoolSettings {
                max_size: db.pool_size,
                idle_timeout: db.idle_timeout,
                connect_timeout: db.connect_timeout,
                ..PoolSettings::default()
            },
            signal_tx.clone(),
        ));
        info!(addr = %db.addr(), size = db.pool_size, "datastore pool ready");

        let (monitor, cache_handle) = HealthMonitor::new(
            "cache",
            TcpManager::new(config.cache.addr(), config.cache.connect_timeout),
            config.retry.clone(),
            signal_tx,
            shutdown_rx,
        );
        let monitor_task = tokio::spawn(monitor.run());
        info!(addr = %config.cache.addr(), required = config.cache.required, "cache monitor started");

        let storage = match &config.storage {
            Some(cfg) => {
                info!(bucket = %cfg.bucket, region = %cfg.region, "object storage enabled");
                Some(S3Store::new(cfg)?)
            }
            None => None,
        };
        let (payment, webhooks) = match &config.payment {
            Some(cfg) => {
                info!(api_base = %cfg.api_base, "payment provider enabled");
                (
                    Some(HttpPaymentProvider::new(cfg)?),
                    Some(WebhookVerifier::new(&cfg.webhook_secret)),
                )
            }
            None => (None, None),
        };

        let core = Self {
            config,
            database: pool,
            cache: cache_handle,
            storage,
            payment,
            webhooks,
            shutdown: shutdown_tx,
            monitor_task,
        };
        Ok((core, Supervisor { signals: signal_rx }))
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Pool<TcpManager>> {
        &self.database
    }

    pub fn database_stats(&self) -> PoolStats {
        self.database.stats()
    }

    /// Cache link handle: report errors, receive replacement connections
    pub fn cache(&mut self) -> &mut MonitorHandle<TcpManager> {
        &mut self.cache
    }

    pub fn storage(&self) -> Option<&S3Store> {
        self.storage.as_ref()
    }

    pub fn payment(&self) -> Option<&HttpPaymentProvider> {
        self.payment.as_ref()
    }

    pub fn webhooks(&self) -> Option<&WebhookVerifier> {
        self.webhooks.as_ref()
    }

    /// Whether a permanently failed cache link should end the process
    pub fn cache_required(&self) -> bool {
        self.config.cache.required
    }

    /// Stop the cache monitor, drain the pool, and release everything
    pub async fn shutdown(self, drain_timeout: Duration) {
        info!("shutting down managed resources");
        // Wakes the monitor out of any pending reconnect sleep.
        let _ = self.shutdown.send(true);
        self.database.shutdown(drain_timeout).await;
        let _ = self.monitor_task.await;
        info!("shutdown complete");
    }
}
