// Per-order payment deadline timers

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::order::{Order, OrderId};
use super::order_store::{ExpiryReason, MarkExpiredOutcome, OrderStore};

const TICK_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownTick {
    pub order_id: OrderId,
    /// Whole seconds left, rounded up; zero once the deadline passes.
    pub remaining_seconds: i64,
}

/// "MM:SS" for the time left, or "Expired".
pub fn format_remaining(remaining_seconds: i64) -> String {
    if remaining_seconds <= 0 {
        return "Expired".to_string();
    }
    format!("{:02}:{:02}", remaining_seconds / 60, remaining_seconds % 60)
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ExpiryCountdown {
    orders: Arc<OrderStore>,
    tick_interval: Duration,
    timers: Arc<Mutex<HashMap<OrderId, Timer>>>,
    ticks: broadcast::Sender<CountdownTick>,
    generation: Arc<AtomicU64>,
}

impl ExpiryCountdown {
    pub fn new(orders: Arc<OrderStore>, tick_interval: Duration) -> Self {
        let (ticks, _rx) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        Self {
            orders,
            tick_interval: tick_interval.max(Duration::from_millis(1)),
            timers: Arc::new(Mutex::new(HashMap::new())),
            ticks,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CountdownTick> {
        self.ticks.subscribe()
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<OrderId, Timer>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the timer for `order_id`, replacing any running one.
    pub fn start(&self, order_id: OrderId, expires_at: DateTime<Utc>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers();
        if let Some(prev) = timers.remove(&order_id) {
            prev.handle.abort();
        }

        let this = self.clone();
        let id = order_id.clone();
        let handle = tokio::spawn(async move {
            this.run(&id, expires_at).await;
            this.forget(&id, generation);
        });
        debug!(order_id = %order_id, expires_at = %expires_at, "Started payment countdown");
        timers.insert(order_id, Timer { generation, handle });
    }

    async fn run(&self, order_id: &OrderId, expires_at: DateTime<Utc>) {
        loop {
            let remaining = expires_at - Utc::now();
            let remaining_ms = remaining.num_milliseconds();
            if remaining_ms <= 0 {
                let _ = self.ticks.send(CountdownTick {
                    order_id: order_id.clone(),
                    remaining_seconds: 0,
                });
                match self.orders.mark_expired(order_id, ExpiryReason::Deadline).await {
                    Ok(MarkExpiredOutcome::Expired) => {
                        info!(order_id = %order_id, "Payment window closed; order expired")
                    }
                    Ok(outcome) => debug!(order_id = %order_id, outcome = ?outcome, "Countdown ended"),
                    Err(e) => warn!(order_id = %order_id, error = %e, "Failed to expire order"),
                }
                return;
            }

            let _ = self.ticks.send(CountdownTick {
                order_id: order_id.clone(),
                remaining_seconds: (remaining_ms + 999) / 1000,
            });
            let until_deadline = Duration::from_millis(remaining_ms.unsigned_abs());
            tokio::time::sleep(until_deadline.min(self.tick_interval)).await;
        }
    }

    fn forget(&self, order_id: &OrderId, generation: u64) {
        let mut timers = self.timers();
        if timers.get(order_id).is_some_and(|t| t.generation == generation) {
            timers.remove(order_id);
        }
    }

    pub fn stop(&self, order_id: &OrderId) -> bool {
        match self.timers().remove(order_id) {
            Some(timer) => {
                timer.handle.abort();
                debug!(order_id = %order_id, "Stopped payment countdown");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) -> usize {
        let drained: Vec<Timer> = self.timers().drain().map(|(_, t)| t).collect();
        for timer in &drained {
            timer.handle.abort();
        }
        drained.len()
    }

    /// Replace all timers with one per unpaid order that has a deadline.
    pub fn sync(&self, orders: &[Order]) -> usize {
        self.stop_all();
        let mut started = 0;
        for order in orders.iter().filter(|o| o.is_unpaid()) {
            if let Some(expires_at) = order.payment_expiry_time {
                self.start(order.id.clone(), expires_at);
                started += 1;
            }
        }
        started
    }

    pub fn is_running(&self, order_id: &OrderId) -> bool {
        self.timers()
            .get(order_id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        self.timers().len()
    }
}
