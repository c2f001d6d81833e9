use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{
    extractors::TrustedProxies,
    notify::{LogNotifier, Notifier},
    password::PasswordHashing,
    rate_limit::RateLimiter,
    repo::AuthStore,
    repo_memory::MemoryStore,
    services::AuthService,
};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::db::PgStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub service: Arc<AuthService>,
    pub limiter: Arc<RateLimiter>,
    pub proxies: Arc<TrustedProxies>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;

        let store: Arc<dyn AuthStore> = match &config.database_url {
            Some(url) => {
                let store = PgStore::connect(url).await?;
                store.migrate().await?;
                info!("using postgres credential store");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory credential store");
                Arc::new(MemoryStore::new())
            }
        };

        let hashing = PasswordHashing::default();
        hashing.decoy_hash().await?;
        if config.security.trusted_proxies.is_empty() {
            info!("no trusted proxies; clients are identified by socket address");
        } else {
            info!(proxies = ?config.security.trusted_proxies, "forwarding headers trusted from proxies");
        }

        Ok(Self::from_parts(
            config,
            store,
            Arc::new(SystemClock),
            Arc::new(LogNotifier),
            hashing,
        ))
    }

    pub fn from_parts(
        config: AppConfig,
        store: Arc<dyn AuthStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        hashing: PasswordHashing,
    ) -> Self {
        let service = AuthService::new(&config, store, clock.clone(), notifier, hashing);
        let proxies = TrustedProxies::new(config.security.trusted_proxies.iter().copied());
        Self {
            proxies: Arc::new(proxies),
            config: Arc::new(config),
            service: Arc::new(service),
            limiter: Arc::new(RateLimiter::new(clock)),
        }
    }

    /// Periodically evicts idle rate-limit windows and stale lockouts.
    pub fn spawn_janitor(&self) -> JoinHandle<()> {
        let limiter = self.limiter.clone();
        let service = self.service.clone();
        let period = Duration::from_secs(self.config.security.rate_limit_sweep_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let windows = limiter.sweep();
                let lockouts = service.sweep_lockouts();
                debug!(windows, lockouts, "janitor sweep");
            }
        })
    }
}
