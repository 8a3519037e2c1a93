//! Bridge sync: recovers in-flight transfers and refreshes local state
//!
//! One pass restores the pending-transfer registry from the cache directory,
//! reconciles any outstanding withdrawal, resumes interrupted deposits,
//! refreshes balances and updates the gateway log caches. With `--watch` the
//! pass repeats every 30 seconds until Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use gateway_bridge::{
    evm, AssetRegistry, BalanceStore, BridgeConfig, ChainClient, ChainRole, DepositStateMachine,
    Direction, EnvKeyStore, FileStore, KeyValueStore, LogLoader, PendingTransferTracker,
    TransferHistory, WithdrawalStateMachine,
};

const HOME_KEY: &str = "HOME_PRIVATE_KEY";
const SIDE_KEY: &str = "SIDE_PRIVATE_KEY";
const WATCH_INTERVAL: Duration = Duration::from_secs(30);

struct BridgeSync {
    registry: Arc<AssetRegistry>,
    tracker: Arc<PendingTransferTracker>,
    balances: Arc<BalanceStore>,
    home: Arc<dyn ChainClient>,
    side: Arc<dyn ChainClient>,
    deposits: DepositStateMachine<dyn ChainClient, dyn ChainClient>,
    withdrawals: WithdrawalStateMachine<dyn ChainClient, dyn ChainClient>,
    home_logs: LogLoader<dyn ChainClient>,
}

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();
    let watch = std::env::args().any(|arg| arg == "--watch");

    tracing::info!("Starting bridge sync");

    let config = BridgeConfig::load()?;
    tracing::info!(
        home_chain = %config.home.chain_id,
        side_chain = %config.side.chain_id,
        confirmations = config.policy.deposit_confirmations,
        "Configuration loaded"
    );

    let sync = BridgeSync::connect(&config).await?;

    if !watch {
        return sync.pass().await;
    }

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        if let Err(e) = sync.pass().await {
            tracing::error!(error = %e, "Sync pass failed");
        }
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(WATCH_INTERVAL) => {}
        }
    }

    tracing::info!("Bridge sync stopped");
    Ok(())
}

impl BridgeSync {
    async fn connect(config: &BridgeConfig) -> eyre::Result<Self> {
        let registry = Arc::new(
            AssetRegistry::load(&config.asset_registry_path)
                .wrap_err("Failed to load asset registry")?,
        );
        tracing::info!(assets = registry.len(), "Asset registry loaded");

        let keys = EnvKeyStore::new();
        let home = evm::connect(
            &config.home,
            evm::load_signer(&keys, HOME_KEY).await?,
            &config.policy,
        )?;
        let side = evm::connect(
            &config.side,
            evm::load_signer(&keys, SIDE_KEY).await?,
            &config.policy,
        )?;

        let store: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::open(&config.cache_dir)
                .await
                .wrap_err("Failed to open cache directory")?,
        );
        let tracker = Arc::new(PendingTransferTracker::restore(store.clone()).await?);
        let balances = Arc::new(BalanceStore::new());

        let deposits = DepositStateMachine::new(
            home.clone(),
            side.clone(),
            tracker.clone(),
            balances.clone(),
            config.policy.clone(),
        );
        let withdrawals = WithdrawalStateMachine::new(
            home.clone(),
            side.clone(),
            tracker.clone(),
            balances.clone(),
            registry.clone(),
            config.policy.clone(),
        );
        let home_logs = LogLoader::new(home.clone(), store, config.log_loader(ChainRole::Home));

        Ok(Self {
            registry,
            tracker,
            balances,
            home,
            side,
            deposits,
            withdrawals,
            home_logs,
        })
    }

    async fn pass(&self) -> eyre::Result<()> {
        let outcome = self
            .withdrawals
            .reconcile()
            .await
            .wrap_err("Withdrawal reconciliation failed")?;
        tracing::info!(?outcome, "Withdrawals reconciled");

        for address in self.tracker.assets(Direction::Deposit).await {
            let Some(asset) = self.registry.by_home_address(address) else {
                tracing::warn!(asset = %address, "Pending deposit for an unregistered asset");
                continue;
            };
            match self.deposits.resume(asset).await {
                Ok(state) => tracing::info!(asset = %asset.symbol, %state, "Deposit resumed"),
                Err(e) => tracing::warn!(asset = %asset.symbol, error = %e, "Deposit resume failed"),
            }
        }

        for asset in self.registry.iter() {
            // Failures are logged by the store; the last known value stays
            let _ = self.balances.refresh(self.home.as_ref(), asset).await;
            let _ = self.balances.refresh(self.side.as_ref(), asset).await;

            let history = TransferHistory::load(&self.home_logs, asset).await;
            tracing::info!(
                asset = %asset.symbol,
                records = history.records.len(),
                stale = history.stale,
                "History updated"
            );
        }

        for (address, balance) in self.balances.snapshot().await {
            tracing::info!(
                address = %address,
                amount = %balance.amount,
                provisional = balance.provisional,
                "Balance"
            );
        }
        for direction in [Direction::Deposit, Direction::Withdrawal] {
            for address in self.tracker.assets(direction).await {
                let entries = self.tracker.list(direction, address).await;
                tracing::info!(%direction, asset = %address, steps = entries.len(), "Still pending");
            }
        }
        Ok(())
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gateway_bridge=debug,bridge_sync=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
