//! Payment reconciliation.
//!
//! Pulls the gateway's view of a checkout session and folds it into the
//! order: paid sessions are marked paid and credited, sessions that can no
//! longer be paid expire the order, and everything else is left pending
//! until the deadline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::countdown::ExpiryCountdown;
use super::gateway::{interpret, CheckoutGateway, PaymentVerdict, SessionSnapshot};
use super::order::{points_for, Order, OrderId, PaymentStatus};
use super::order_store::{
    ExpiryReason, MarkExpiredOutcome, MarkPaidOutcome, OrderStore, PointCredit,
};
use super::KeySet;
use crate::checkout_counter_inc;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("order not found: {0}")]
    OrderNotFound(OrderId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Paid {
        points_earned: u32,
        credit: PointCredit,
    },
    AlreadyPaid,
    Pending {
        expires_at: Option<DateTime<Utc>>,
    },
    Expired,
    /// Another check for the same order is running.
    InFlight,
    /// The gateway could not be asked; the order was not touched.
    StatusUnknown {
        reason: String,
    },
}

impl CheckOutcome {
    /// Nothing further can change for the order.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckOutcome::Paid { .. } | CheckOutcome::AlreadyPaid | CheckOutcome::Expired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// The session is still open at `checkout_url`.
    Open {
        checkout_url: String,
        expires_at: Option<DateTime<Utc>>,
    },
    Settled(CheckOutcome),
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Pause before asking the gateway, so a just-completed payment settles.
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    /// Checks after the first one.
    pub max_poll_attempts: u32,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(10),
            max_poll_attempts: 12,
        }
    }
}

struct Poll {
    generation: u64,
    cancel: oneshot::Sender<()>,
}

#[derive(Clone)]
pub struct PaymentReconciler {
    orders: Arc<OrderStore>,
    gateway: Arc<dyn CheckoutGateway>,
    countdown: ExpiryCountdown,
    settings: ReconcilerSettings,
    in_flight: KeySet<OrderId>,
    polls: Arc<Mutex<HashMap<OrderId, Poll>>>,
    generation: Arc<AtomicU64>,
}

impl PaymentReconciler {
    pub fn new(
        orders: Arc<OrderStore>,
        gateway: Arc<dyn CheckoutGateway>,
        countdown: ExpiryCountdown,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            orders,
            gateway,
            countdown,
            settings,
            in_flight: KeySet::new(),
            polls: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reconcile one order against its checkout session.
    #[instrument(skip(self), fields(order_id = %order_id, session_id = %session_id))]
    pub async fn check_status(
        &self,
        order_id: &OrderId,
        session_id: &str,
    ) -> Result<CheckOutcome, ReconcileError> {
        let Some(_guard) = self.in_flight.try_claim(order_id) else {
            debug!("Status check already running");
            return Ok(CheckOutcome::InFlight);
        };

        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| ReconcileError::OrderNotFound(order_id.clone()))?;
        match order.effective_payment_status() {
            PaymentStatus::Paid => {
                self.countdown.stop(order_id);
                return Ok(CheckOutcome::AlreadyPaid);
            }
            PaymentStatus::Expired => return Ok(CheckOutcome::Expired),
            PaymentStatus::Unpaid => {}
        }

        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        checkout_counter_inc!("checkout.reconcile.checks");
        let snapshot = match self.gateway.retrieve_session(session_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Could not retrieve checkout session");
                return Ok(CheckOutcome::StatusUnknown {
                    reason: e.to_string(),
                });
            }
        };
        self.settle(order_id, &order, &snapshot).await
    }

    /// Hand back the hosted checkout page of an unpaid order so the customer
    /// can finish paying. A session that already settled is reconciled
    /// instead.
    #[instrument(skip(self), fields(order_id = %order_id, session_id = %session_id))]
    pub async fn resume_payment(
        &self,
        order_id: &OrderId,
        session_id: &str,
    ) -> Result<ResumeOutcome, ReconcileError> {
        let Some(_guard) = self.in_flight.try_claim(order_id) else {
            return Ok(ResumeOutcome::Settled(CheckOutcome::InFlight));
        };

        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| ReconcileError::OrderNotFound(order_id.clone()))?;
        match order.effective_payment_status() {
            PaymentStatus::Paid => return Ok(ResumeOutcome::Settled(CheckOutcome::AlreadyPaid)),
            PaymentStatus::Expired => return Ok(ResumeOutcome::Settled(CheckOutcome::Expired)),
            PaymentStatus::Unpaid => {}
        }

        let snapshot = match self.gateway.retrieve_session(session_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Could not retrieve checkout session");
                return Ok(ResumeOutcome::Settled(CheckOutcome::StatusUnknown {
                    reason: e.to_string(),
                }));
            }
        };

        let outcome = self.settle(order_id, &order, &snapshot).await?;
        match (outcome, snapshot.checkout_url) {
            (CheckOutcome::Pending { expires_at }, Some(checkout_url)) => {
                info!("Resuming payment");
                Ok(ResumeOutcome::Open {
                    checkout_url,
                    expires_at,
                })
            }
            (CheckOutcome::Pending { .. }, None) => {
                Ok(ResumeOutcome::Settled(CheckOutcome::StatusUnknown {
                    reason: "checkout session has no checkout url".into(),
                }))
            }
            (outcome, _) => Ok(ResumeOutcome::Settled(outcome)),
        }
    }

    async fn settle(
        &self,
        order_id: &OrderId,
        order: &Order,
        snapshot: &SessionSnapshot,
    ) -> Result<CheckOutcome, ReconcileError> {
        let verdict = interpret(snapshot);
        debug!(session_status = %snapshot.status, verdict = ?verdict, "Session interpreted");
        match verdict {
            PaymentVerdict::Paid => {
                let points_earned = points_for(&order.items);
                let outcome = self
                    .orders
                    .mark_paid(order_id, &snapshot.payment_ref(), points_earned)
                    .await?;
                self.countdown.stop(order_id);
                match outcome {
                    MarkPaidOutcome::Paid { credit } => {
                        info!(points_earned, "Payment confirmed");
                        Ok(CheckOutcome::Paid {
                            points_earned,
                            credit,
                        })
                    }
                    MarkPaidOutcome::AlreadyPaid => Ok(CheckOutcome::AlreadyPaid),
                    MarkPaidOutcome::NotPayable { status } => {
                        error!(
                            status = %status,
                            payment_ref = %snapshot.payment_ref(),
                            "Payment received for an order that is no longer payable; needs manual follow-up"
                        );
                        checkout_counter_inc!("checkout.reconcile.paid_after_expiry");
                        Ok(CheckOutcome::Expired)
                    }
                }
            }
            PaymentVerdict::Failed => self.expire(order_id, ExpiryReason::GatewayFailed).await,
            PaymentVerdict::Pending => match order.payment_expiry_time {
                Some(expires_at) if expires_at <= Utc::now() => {
                    self.expire(order_id, ExpiryReason::Deadline).await
                }
                expires_at => Ok(CheckOutcome::Pending { expires_at }),
            },
        }
    }

    async fn expire(
        &self,
        order_id: &OrderId,
        reason: ExpiryReason,
    ) -> Result<CheckOutcome, ReconcileError> {
        let outcome = match self.orders.mark_expired(order_id, reason).await? {
            MarkExpiredOutcome::Expired | MarkExpiredOutcome::AlreadyExpired => CheckOutcome::Expired,
            MarkExpiredOutcome::AlreadyPaid => CheckOutcome::AlreadyPaid,
            MarkExpiredOutcome::NotYetDue { expires_at } => {
                return Ok(CheckOutcome::Pending {
                    expires_at: Some(expires_at),
                })
            }
        };
        self.countdown.stop(order_id);
        Ok(outcome)
    }

    fn polls(&self) -> std::sync::MutexGuard<'_, HashMap<OrderId, Poll>> {
        self.polls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check now, then every poll interval until the order settles or the
    /// attempts run out. Replaces any poll already running for the order.
    pub fn start_polling(&self, order_id: OrderId, session_id: String) -> JoinHandle<()> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel, mut cancelled) = oneshot::channel();
        if let Some(prev) = self.polls().insert(order_id.clone(), Poll { generation, cancel }) {
            let _ = prev.cancel.send(());
        }

        let this = self.clone();
        tokio::spawn(async move {
            for attempt in 0..=this.settings.max_poll_attempts {
                if attempt > 0 {
                    tokio::select! {
                        _ = &mut cancelled => {
                            debug!(order_id = %order_id, attempt, "Polling cancelled");
                            return;
                        }
                        _ = tokio::time::sleep(this.settings.poll_interval) => {}
                    }
                }

                match this.check_status(&order_id, &session_id).await {
                    Ok(outcome) if outcome.is_terminal() => {
                        debug!(order_id = %order_id, attempt, outcome = ?outcome, "Polling finished");
                        break;
                    }
                    Ok(outcome) => {
                        debug!(order_id = %order_id, attempt, outcome = ?outcome, "Payment still open")
                    }
                    Err(e) => {
                        warn!(order_id = %order_id, attempt, error = %e, "Polling stopped");
                        break;
                    }
                }
            }

            let mut polls = this.polls();
            if polls.get(&order_id).is_some_and(|p| p.generation == generation) {
                polls.remove(&order_id);
            }
        })
    }

    /// Stop polling `order_id`; a check already running completes.
    pub fn cancel_polling(&self, order_id: &OrderId) -> bool {
        match self.polls().remove(order_id) {
            Some(poll) => {
                let _ = poll.cancel.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self, order_id: &OrderId) -> bool {
        self.polls().contains_key(order_id)
    }

    /// Cancel every poll and countdown.
    pub fn shutdown(&self) {
        let polls: Vec<Poll> = self.polls().drain().map(|(_, p)| p).collect();
        let cancelled = polls.len();
        for poll in polls {
            let _ = poll.cancel.send(());
        }
        let timers = self.countdown.stop_all();
        info!(polls = cancelled, timers, "Reconciler shut down");
    }

    pub fn countdown(&self) -> &ExpiryCountdown {
        &self.countdown
    }
}
