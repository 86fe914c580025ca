use anyhow::Result;
use nook_checkout::checkout::{CheckoutService, ExpiryCountdown, OrderStore, PaymentReconciler};
use nook_checkout::paymongo::webhook::WebhookConfig;
use nook_checkout::paymongo::PayMongoGateway;
use nook_checkout::server::{self, AppState};
use nook_checkout::settings::Config;
use nook_checkout::store::{DocumentStore, RedbStore};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::load();

    if cfg.paymongo.secret_key.is_empty() {
        tracing::error!("PAYMONGO_SECRET_KEY not set; exiting");
        return Ok(());
    }
    if cfg.paymongo.webhook_secret.is_empty() {
        tracing::warn!("Webhook secret not configured - webhook deliveries will be rejected");
    }
    tracing::info!(
        live_mode = cfg.paymongo.is_live_mode(),
        database = %cfg.database_path,
        "Starting nook checkout service"
    );

    let store: Arc<dyn DocumentStore> = Arc::new(RedbStore::new(&cfg.database_path)?);
    let orders = Arc::new(OrderStore::new(store.clone()));
    let gateway = Arc::new(PayMongoGateway::new(cfg.paymongo.clone())?);
    let countdown = ExpiryCountdown::new(orders.clone(), cfg.checkout.countdown_tick);

    // Resume payment windows of orders that were waiting when we last stopped
    let unpaid = orders.unpaid_orders().await?;
    let resumed = countdown.sync(&unpaid);
    tracing::info!(resumed, "Resumed payment countdowns");

    match orders.orders_pending_point_credit().await {
        Ok(pending) if !pending.is_empty() => {
            tracing::warn!(count = pending.len(), "Paid orders are waiting for point credit")
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Could not list orders pending point credit"),
    }

    let reconciler = PaymentReconciler::new(
        orders.clone(),
        gateway.clone(),
        countdown.clone(),
        cfg.reconciler_settings(),
    );
    let checkout = Arc::new(CheckoutService::new(
        store,
        orders.clone(),
        gateway,
        countdown,
        cfg.checkout_config(),
    ));

    let state = AppState {
        checkout,
        orders,
        reconciler: reconciler.clone(),
        webhook: WebhookConfig {
            secret: cfg.paymongo.webhook_secret.clone(),
            tolerance_seconds: cfg.paymongo.webhook_tolerance_seconds,
            live_mode: cfg.paymongo.is_live_mode(),
        },
    };

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Shutdown requested");
        let _ = stop_tx.send(());
    });

    server::run(cfg.server_port, state, async {
        let _ = stop_rx.await;
    })
    .await?;

    reconciler.shutdown();
    tracing::info!("Checkout service stopped");
    Ok(())
}
