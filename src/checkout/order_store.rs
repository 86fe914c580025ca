//! Order persistence and the payment state machine.
//!
//! Every transition is a compare-and-set inside a store transaction, so two
//! reconcilers racing on one order settle on a single winner. Loyalty points
//! are credited in a second transaction guarded by the order's
//! `pointsCredited` flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::order::{NewOrder, Order, OrderId, OrderStatus, PaymentStatus, ORDERS_COLLECTION};
use crate::checkout_counter_inc;
use crate::store::{
    decode, encode, get_as, txn_get_as, DocPath, DocumentStore, StoreError, TxnContext,
};

pub const USERS_COLLECTION: &str = "users";

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Loyalty balance at `users/{uid}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserPoints {
    pub points: u64,
    pub orders_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PointCredit {
    Credited { points: u32 },
    AlreadyCredited,
    NotPaid,
    /// The order is paid but the balance was not touched; retry later.
    Deferred { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MarkPaidOutcome {
    Paid { credit: PointCredit },
    AlreadyPaid,
    NotPayable { status: PaymentStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// The payment window elapsed; refused while time remains.
    Deadline,
    /// The gateway reported the session as definitively failed.
    GatewayFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MarkExpiredOutcome {
    Expired,
    AlreadyExpired,
    AlreadyPaid,
    NotYetDue { expires_at: DateTime<Utc> },
}

/// Committed state of one order.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order: Order,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidOrder {
    pub order_id: OrderId,
    pub credit: PointCredit,
}

pub fn order_path(id: &OrderId) -> DocPath {
    DocPath::new(ORDERS_COLLECTION, id.as_str())
}

pub fn user_path(uid: &str) -> DocPath {
    DocPath::new(USERS_COLLECTION, uid)
}

fn load_order(txn: &mut dyn TxnContext, path: &DocPath) -> Result<Order, StoreError> {
    txn_get_as(txn, path)?.ok_or_else(|| StoreError::NotFound(path.clone()))
}

pub struct OrderStore {
    store: Arc<dyn DocumentStore>,
    updates: broadcast::Sender<OrderUpdate>,
}

impl OrderStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let (updates, _rx) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self { store, updates }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderUpdate> {
        self.updates.subscribe()
    }

    fn publish(&self, order: Order) {
        let _ = self.updates.send(OrderUpdate { order });
    }

    /// Persist an online order waiting for payment through `session_id`.
    /// Repeating the call for the same session returns the existing id.
    #[instrument(skip(self, new), fields(session_id = %session_id))]
    pub async fn create_unpaid_order(
        &self,
        new: NewOrder,
        session_id: &str,
        expiry: DateTime<Utc>,
    ) -> Result<OrderId, StoreError> {
        let id = OrderId::for_session(session_id);
        let path = order_path(&id);

        let mut order = new.into_order(id.clone(), PaymentStatus::Unpaid, Utc::now());
        order.checkout_session_id = Some(session_id.to_string());
        order.payment_expiry_time = Some(expiry);
        let doc = encode(&order)?;

        let mut created = false;
        self.store
            .transaction(&mut |txn: &mut dyn TxnContext| -> Result<Value, StoreError> {
                created = txn.get(&path)?.is_none();
                if created {
                    txn.set(&path, doc.clone())?;
                }
                Ok(Value::Null)
            })
            .await?;

        if created {
            info!(order_id = %id, expires_at = %expiry, "Created unpaid order");
            checkout_counter_inc!("checkout.orders.created", "payment_status" => "unpaid");
            self.publish(order);
        } else {
            debug!(order_id = %id, "Order for session already exists");
        }
        Ok(id)
    }

    /// Persist a cash order as paid and credit its points.
    #[instrument(skip(self, new))]
    pub async fn create_paid_order(
        &self,
        new: NewOrder,
        payment_ref: Option<String>,
    ) -> Result<PaidOrder, StoreError> {
        let id = OrderId::random();
        let mut order = new.into_order(id.clone(), PaymentStatus::Paid, Utc::now());
        order.payment_id = payment_ref;

        self.store.set(&order_path(&id), encode(&order)?).await?;
        info!(order_id = %id, total = %order.total, "Created paid order");
        checkout_counter_inc!("checkout.orders.created", "payment_status" => "paid");
        self.publish(order);

        let credit = self.credit_points(&id).await;
        Ok(PaidOrder {
            order_id: id,
            credit,
        })
    }

    /// Move an unpaid order to paid, then credit its points.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_paid(
        &self,
        order_id: &OrderId,
        payment_ref: &str,
        points_earned: u32,
    ) -> Result<MarkPaidOutcome, StoreError> {
        let path = order_path(order_id);
        let mut result: Option<Result<Order, MarkPaidOutcome>> = None;

        self.store
            .transaction(&mut |txn: &mut dyn TxnContext| -> Result<Value, StoreError> {
                let mut order = load_order(txn, &path)?;
                result = Some(match order.effective_payment_status() {
                    PaymentStatus::Paid => Err(MarkPaidOutcome::AlreadyPaid),
                    status @ PaymentStatus::Expired => Err(MarkPaidOutcome::NotPayable { status }),
                    PaymentStatus::Unpaid => {
                        txn.update(
                            &path,
                            json!({
                                "paymentStatus": PaymentStatus::Paid,
                                "paymentId": payment_ref,
                                "pointsEarned": points_earned,
                                "paymentExpiryTime": Value::Null,
                            }),
                        )?;
                        order.payment_status = Some(PaymentStatus::Paid);
                        order.payment_id = Some(payment_ref.to_string());
                        order.points_earned = points_earned;
                        order.payment_expiry_time = None;
                        Ok(order)
                    }
                });
                Ok(Value::Null)
            })
            .await?;

        // Err carries the outcome of an order that did not move
        let order = match result {
            Some(Ok(order)) => order,
            Some(Err(outcome)) => {
                debug!(outcome = ?outcome, "Order not moved to paid");
                return Ok(outcome);
            }
            None => return Err(StoreError::Aborted("transaction produced no outcome".into())),
        };

        info!(points_earned, "Order marked paid");
        checkout_counter_inc!("checkout.orders.paid");
        self.publish(order);

        let credit = self.credit_points(order_id).await;
        Ok(MarkPaidOutcome::Paid { credit })
    }

    /// Add the order's points to the customer balance if that has not
    /// happened yet. Failures leave the order paid and uncredited.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn credit_points(&self, order_id: &OrderId) -> PointCredit {
        match self.try_credit_points(order_id).await {
            Ok(credit) => credit,
            Err(e) => {
                warn!(error = %e, "Point credit deferred");
                checkout_counter_inc!("checkout.points.deferred");
                PointCredit::Deferred {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_credit_points(&self, order_id: &OrderId) -> Result<PointCredit, StoreError> {
        let path = order_path(order_id);
        let mut result: Option<(PointCredit, Option<Order>)> = None;

        self.store
            .transaction(&mut |txn: &mut dyn TxnContext| -> Result<Value, StoreError> {
                let mut order = load_order(txn, &path)?;
                if order.effective_payment_status() != PaymentStatus::Paid {
                    result = Some((PointCredit::NotPaid, None));
                    return Ok(Value::Null);
                }
                if order.points_credited {
                    result = Some((PointCredit::AlreadyCredited, None));
                    return Ok(Value::Null);
                }

                let points = order.points_earned;
                let user = user_path(&order.customer_id);
                match txn.get(&user)? {
                    Some(doc) => {
                        let balance: UserPoints = decode(doc)?;
                        txn.update(
                            &user,
                            json!({
                                "points": balance.points + u64::from(points),
                                "ordersCount": balance.orders_count + 1,
                            }),
                        )?;
                    }
                    None => {
                        let balance = UserPoints {
                            points: u64::from(points),
                            orders_count: 1,
                            name: Some(order.customer_name.clone()),
                            email: Some(order.customer_email.clone()),
                        };
                        txn.set(&user, encode(&balance)?)?;
                    }
                }

                txn.update(&path, json!({"pointsCredited": true}))?;
                order.points_credited = true;
                result = Some((PointCredit::Credited { points }, Some(order)));
                Ok(Value::Null)
            })
            .await?;

        let Some((credit, changed)) = result else {
            return Err(StoreError::Aborted("transaction produced no outcome".into()));
        };
        if let Some(order) = changed {
            info!(customer_id = %order.customer_id, credit = ?credit, "Credited loyalty points");
            checkout_counter_inc!("checkout.points.credited");
            self.publish(order);
        }
        Ok(credit)
    }

    /// Retry the point credit of a paid order.
    pub async fn retry_point_credit(&self, order_id: &OrderId) -> Result<PointCredit, StoreError> {
        if self.get(order_id).await?.is_none() {
            return Err(StoreError::NotFound(order_path(order_id)));
        }
        Ok(self.credit_points(order_id).await)
    }

    /// Paid orders whose points never reached the balance.
    pub async fn orders_pending_point_credit(&self) -> Result<Vec<Order>, StoreError> {
        let mut orders = self.query_orders("pointsCredited", json!(false)).await?;
        orders.retain(|o| o.effective_payment_status() == PaymentStatus::Paid);
        Ok(orders)
    }

    /// Expire an unpaid order and cancel it.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_expired(
        &self,
        order_id: &OrderId,
        reason: ExpiryReason,
    ) -> Result<MarkExpiredOutcome, StoreError> {
        let path = order_path(order_id);
        let now = Utc::now();
        let mut result: Option<(MarkExpiredOutcome, Option<Order>)> = None;

        self.store
            .transaction(&mut |txn: &mut dyn TxnContext| -> Result<Value, StoreError> {
                let mut order = load_order(txn, &path)?;
                result = Some(match order.effective_payment_status() {
                    PaymentStatus::Paid => (MarkExpiredOutcome::AlreadyPaid, None),
                    PaymentStatus::Expired => (MarkExpiredOutcome::AlreadyExpired, None),
                    PaymentStatus::Unpaid => match order.payment_expiry_time {
                        Some(expires_at) if reason == ExpiryReason::Deadline && expires_at > now => {
                            (MarkExpiredOutcome::NotYetDue { expires_at }, None)
                        }
                        _ => {
                            txn.update(
                                &path,
                                json!({
                                    "paymentStatus": PaymentStatus::Expired,
                                    "status": OrderStatus::Cancelled,
                                }),
                            )?;
                            order.payment_status = Some(PaymentStatus::Expired);
                            order.status = OrderStatus::Cancelled;
                            (MarkExpiredOutcome::Expired, Some(order))
                        }
                    },
                });
                Ok(Value::Null)
            })
            .await?;

        let Some((outcome, changed)) = result else {
            return Err(StoreError::Aborted("transaction produced no outcome".into()));
        };
        if let Some(order) = changed {
            info!(reason = ?reason, "Order payment expired");
            checkout_counter_inc!("checkout.orders.expired");
            self.publish(order);
        }
        Ok(outcome)
    }

    pub async fn get(&self, order_id: &OrderId) -> Result<Option<Order>, StoreError> {
        get_as(self.store.as_ref(), &order_path(order_id)).await
    }

    /// Order created for a gateway checkout session.
    pub async fn find_by_session(&self, session_id: &str) -> Result<Option<Order>, StoreError> {
        if let Some(order) = self.get(&OrderId::for_session(session_id)).await? {
            return Ok(Some(order));
        }
        let mut orders = self
            .query_orders("checkoutSessionId", json!(session_id))
            .await?;
        Ok(orders.pop())
    }

    /// Orders placed by `uid`, newest first.
    pub async fn orders_for_customer(&self, uid: &str) -> Result<Vec<Order>, StoreError> {
        let mut orders = self.query_orders("customerId", json!(uid)).await?;
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    pub async fn unpaid_orders(&self) -> Result<Vec<Order>, StoreError> {
        self.query_orders("paymentStatus", json!(PaymentStatus::Unpaid))
            .await
    }

    pub async fn user_points(&self, uid: &str) -> Result<UserPoints, StoreError> {
        Ok(get_as(self.store.as_ref(), &user_path(uid))
            .await?
            .unwrap_or_default())
    }

    async fn query_orders(&self, field: &str, value: Value) -> Result<Vec<Order>, StoreError> {
        self.store
            .query(ORDERS_COLLECTION, field, &value)
            .await?
            .into_iter()
            .map(|(_, doc)| decode(doc))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::testing::{new_order, FailingUserStore};
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn store() -> (Arc<MemoryStore>, OrderStore) {
        let mem = Arc::new(MemoryStore::new());
        let orders = OrderStore::new(mem.clone());
        (mem, orders)
    }

    #[tokio::test]
    async fn test_repeat_creation_for_session_is_idempotent() {
        let (mem, orders) = store();
        let expiry = Utc::now() + Duration::minutes(10);

        let a = orders
            .create_unpaid_order(new_order("u1", 2), "cs_1", expiry)
            .await
            .unwrap();
        let b = orders
            .create_unpaid_order(new_order("u1", 2), "cs_1", expiry)
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(mem.len().await, 1);
        let order = orders.get(&a).await.unwrap().unwrap();
        assert_eq!(order.payment_status, Some(PaymentStatus::Unpaid));
        assert_eq!(order.checkout_session_id.as_deref(), Some("cs_1"));
        assert_eq!(order.payment_expiry_time, Some(expiry));
    }

    #[tokio::test]
    async fn test_mark_paid_twice_credits_once() {
        let (_mem, orders) = store();
        let id = orders
            .create_unpaid_order(new_order("u1", 3), "cs_1", Utc::now() + Duration::minutes(10))
            .await
            .unwrap();

        let first = orders.mark_paid(&id, "pay_1", 3).await.unwrap();
        let second = orders.mark_paid(&id, "pay_1", 3).await.unwrap();

        assert_eq!(
            first,
            MarkPaidOutcome::Paid {
                credit: PointCredit::Credited { points: 3 }
            }
        );
        assert_eq!(second, MarkPaidOutcome::AlreadyPaid);

        let balance = orders.user_points("u1").await.unwrap();
        assert_eq!(balance.points, 3);
        assert_eq!(balance.orders_count, 1);

        let order = orders.get(&id).await.unwrap().unwrap();
        assert!(order.points_credited);
        assert_eq!(order.payment_id.as_deref(), Some("pay_1"));
        assert!(order.payment_expiry_time.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_mark_paid_credits_once() {
        let (_mem, orders) = store();
        let orders = Arc::new(orders);
        let id = orders
            .create_unpaid_order(new_order("u1", 2), "cs_1", Utc::now() + Duration::minutes(10))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let orders = orders.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                orders.mark_paid(&id, "pay_1", 2).await.unwrap()
            }));
        }
        let mut paid = 0;
        for t in tasks {
            if matches!(t.await.unwrap(), MarkPaidOutcome::Paid { .. }) {
                paid += 1;
            }
        }

        assert_eq!(paid, 1);
        assert_eq!(orders.user_points("u1").await.unwrap().points, 2);
    }

    #[tokio::test]
    async fn test_expired_order_rejects_mark_paid() {
        let (_mem, orders) = store();
        let id = orders
            .create_unpaid_order(new_order("u1", 1), "cs_1", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(
            orders.mark_expired(&id, ExpiryReason::Deadline).await.unwrap(),
            MarkExpiredOutcome::Expired
        );
        assert_eq!(
            orders.mark_paid(&id, "pay_1", 1).await.unwrap(),
            MarkPaidOutcome::NotPayable {
                status: PaymentStatus::Expired
            }
        );

        let order = orders.get(&id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(orders.user_points("u1").await.unwrap().points, 0);
    }

    #[tokio::test]
    async fn test_deadline_expiry_waits_for_deadline() {
        let (_mem, orders) = store();
        let expiry = Utc::now() + Duration::minutes(5);
        let id = orders
            .create_unpaid_order(new_order("u1", 1), "cs_1", expiry)
            .await
            .unwrap();

        assert_eq!(
            orders.mark_expired(&id, ExpiryReason::Deadline).await.unwrap(),
            MarkExpiredOutcome::NotYetDue { expires_at: expiry }
        );
        assert_eq!(
            orders
                .mark_expired(&id, ExpiryReason::GatewayFailed)
                .await
                .unwrap(),
            MarkExpiredOutcome::Expired
        );
        assert_eq!(
            orders
                .mark_expired(&id, ExpiryReason::GatewayFailed)
                .await
                .unwrap(),
            MarkExpiredOutcome::AlreadyExpired
        );
    }

    #[tokio::test]
    async fn test_paid_order_is_never_expired() {
        let (_mem, orders) = store();
        let id = orders
            .create_unpaid_order(new_order("u1", 1), "cs_1", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        orders.mark_paid(&id, "pay_1", 1).await.unwrap();

        assert_eq!(
            orders.mark_expired(&id, ExpiryReason::Deadline).await.unwrap(),
            MarkExpiredOutcome::AlreadyPaid
        );
    }

    #[tokio::test]
    async fn test_cash_order_is_paid_and_credited() {
        let (_mem, orders) = store();
        let placed = orders.create_paid_order(new_order("u1", 4), None).await.unwrap();

        assert_eq!(placed.credit, PointCredit::Credited { points: 4 });
        let order = orders.get(&placed.order_id).await.unwrap().unwrap();
        assert_eq!(order.payment_status, Some(PaymentStatus::Paid));
        assert!(order.payment_expiry_time.is_none());
        assert_eq!(orders.user_points("u1").await.unwrap().points, 4);
    }

    #[tokio::test]
    async fn test_credit_adds_to_existing_balance() {
        let (mem, orders) = store();
        mem.set(
            &user_path("u1"),
            json!({"points": 10, "ordersCount": 2, "name": "Ana", "phone": "0917"}),
        )
        .await
        .unwrap();

        orders.create_paid_order(new_order("u1", 1), None).await.unwrap();

        let doc = mem.get(&user_path("u1")).await.unwrap().unwrap();
        assert_eq!(doc["points"], json!(11));
        assert_eq!(doc["ordersCount"], json!(3));
        assert_eq!(doc["phone"], json!("0917"));
    }

    #[tokio::test]
    async fn test_failed_credit_is_deferred_and_repairable() {
        let failing = Arc::new(FailingUserStore::new());
        let orders = OrderStore::new(failing.clone());
        let id = orders
            .create_unpaid_order(new_order("u1", 2), "cs_1", Utc::now() + Duration::minutes(10))
            .await
            .unwrap();

        failing.fail_user_writes(true);
        let outcome = orders.mark_paid(&id, "pay_1", 2).await.unwrap();
        assert!(matches!(
            outcome,
            MarkPaidOutcome::Paid {
                credit: PointCredit::Deferred { .. }
            }
        ));

        let order = orders.get(&id).await.unwrap().unwrap();
        assert_eq!(order.payment_status, Some(PaymentStatus::Paid));
        assert!(!order.points_credited);
        let pending = orders.orders_pending_point_credit().await.unwrap();
        assert_eq!(pending.len(), 1);

        failing.fail_user_writes(false);
        assert_eq!(
            orders.retry_point_credit(&id).await.unwrap(),
            PointCredit::Credited { points: 2 }
        );
        assert_eq!(
            orders.retry_point_credit(&id).await.unwrap(),
            PointCredit::AlreadyCredited
        );
        assert!(orders.orders_pending_point_credit().await.unwrap().is_empty());
        assert_eq!(orders.user_points("u1").await.unwrap().points, 2);
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let (_mem, orders) = store();
        let err = orders
            .mark_paid(&OrderId::new("missing"), "pay_1", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(orders
            .retry_point_credit(&OrderId::new("missing"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_customer_orders_newest_first_and_unpaid_listing() {
        let (_mem, orders) = store();
        let older = orders.create_paid_order(new_order("u1", 1), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = orders
            .create_unpaid_order(new_order("u1", 1), "cs_9", Utc::now() + Duration::minutes(10))
            .await
            .unwrap();
        orders.create_paid_order(new_order("u2", 1), None).await.unwrap();

        let mine = orders.orders_for_customer("u1").await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].id, newer);
        assert_eq!(mine[1].id, older.order_id);

        let unpaid = orders.unpaid_orders().await.unwrap();
        assert_eq!(unpaid.len(), 1);
        assert_eq!(
            orders.find_by_session("cs_9").await.unwrap().map(|o| o.id),
            Some(newer)
        );
    }

    #[tokio::test]
    async fn test_every_change_is_published_once() {
        let (_mem, orders) = store();
        let mut rx = orders.subscribe();
        let id = orders
            .create_unpaid_order(new_order("u1", 1), "cs_1", Utc::now() + Duration::minutes(10))
            .await
            .unwrap();
        orders.mark_paid(&id, "pay_1", 1).await.unwrap();
        orders.mark_paid(&id, "pay_1", 1).await.unwrap();

        let created = rx.recv().await.unwrap();
        assert_eq!(created.order.payment_status, Some(PaymentStatus::Unpaid));
        let paid = rx.recv().await.unwrap();
        assert_eq!(paid.order.payment_status, Some(PaymentStatus::Paid));
        assert!(!paid.order.points_credited);
        let credited = rx.recv().await.unwrap();
        assert!(credited.order.points_credited);
        assert!(rx.try_recv().is_err());
    }
}
