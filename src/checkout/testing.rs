// Shared fixtures for checkout tests

use async_trait::async_trait;
use rust_decimal_macros::dec;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

use super::cart::{CartItem, Identity};
use super::gateway::{
    CheckoutGateway, CreateSessionRequest, CreatedSession, GatewayError, IntentSnapshot,
    PaymentSnapshot, SessionSnapshot,
};
use super::merchant::{PaymentSettings, TaxSettings};
use super::order::{DiningMode, NewOrder, PaymentMethod};
use super::pricing;
use crate::store::{DocPath, DocumentChange, DocumentStore, MemoryStore, StoreError, TxnContext, TxnFn};

pub(crate) fn identity(uid: &str) -> Identity {
    Identity {
        uid: uid.to_string(),
        email: format!("{uid}@example.com"),
        display_name: Some(format!("Customer {uid}")),
    }
}

/// Order with one line of `quantity` lattes.
pub(crate) fn new_order(uid: &str, quantity: u32) -> NewOrder {
    let items = vec![CartItem::new("latte", "Latte", dec!(120)).with_quantity(quantity)];
    let cart_total = items.iter().map(CartItem::line_total).sum();
    let pricing = pricing::calculate(
        cart_total,
        &TaxSettings::default(),
        &PaymentSettings::default(),
        None,
    );
    NewOrder::from_cart(
        identity(uid),
        &items,
        pricing,
        PaymentMethod::Gcash,
        DiningMode::Pickup,
    )
}

pub(crate) fn snapshot(session_id: &str, status: &str) -> SessionSnapshot {
    SessionSnapshot {
        session_id: session_id.to_string(),
        status: status.to_string(),
        checkout_url: Some(format!("https://checkout.example/{session_id}")),
        payment_intent: None,
    }
}

/// Session still active whose first payment already reads `paid`.
pub(crate) fn paid_payment_snapshot(session_id: &str) -> SessionSnapshot {
    SessionSnapshot {
        session_id: session_id.to_string(),
        status: "active".to_string(),
        checkout_url: None,
        payment_intent: Some(IntentSnapshot {
            id: Some("pi_1".to_string()),
            status: "processing".to_string(),
            payments: vec![PaymentSnapshot {
                id: "pay_1".to_string(),
                status: "paid".to_string(),
            }],
        }),
    }
}

/// Gateway double returning scripted snapshots, then `fallback`.
pub(crate) struct ScriptedGateway {
    script: Mutex<VecDeque<Result<SessionSnapshot, GatewayError>>>,
    fallback: Mutex<SessionSnapshot>,
    fail_create: AtomicBool,
    retrieve_delay: Duration,
    created: Mutex<Vec<CreateSessionRequest>>,
    retrieves: AtomicUsize,
}

impl ScriptedGateway {
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(snapshot("", "active")),
            fail_create: AtomicBool::new(false),
            retrieve_delay: Duration::ZERO,
            created: Mutex::new(Vec::new()),
            retrieves: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_retrieve_delay(mut self, delay: Duration) -> Self {
        self.retrieve_delay = delay;
        self
    }

    pub(crate) fn push(&self, next: Result<SessionSnapshot, GatewayError>) {
        self.script.lock().unwrap().push_back(next);
    }

    pub(crate) fn set_fallback(&self, snapshot: SessionSnapshot) {
        *self.fallback.lock().unwrap() = snapshot;
    }

    pub(crate) fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn created(&self) -> Vec<CreateSessionRequest> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn retrieves(&self) -> usize {
        self.retrieves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckoutGateway for ScriptedGateway {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<CreatedSession, GatewayError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: Some(400),
                code: Some("parameter_invalid".into()),
                detail: Some("amount is below the minimum".into()),
            });
        }
        let mut created = self.created.lock().unwrap();
        created.push(req);
        let session_id = format!("cs_test_{}", created.len());
        Ok(CreatedSession {
            checkout_url: format!("https://checkout.example.com/{session_id}"),
            session_id,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<SessionSnapshot, GatewayError> {
        self.retrieves.fetch_add(1, Ordering::SeqCst);
        if !self.retrieve_delay.is_zero() {
            tokio::time::sleep(self.retrieve_delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => {
                let mut fallback = self.fallback.lock().unwrap().clone();
                fallback.session_id = session_id.to_string();
                Ok(fallback)
            }
        }
    }
}

/// Memory store whose writes to `users/*` can be made to fail.
pub(crate) struct FailingUserStore {
    inner: MemoryStore,
    fail_users: AtomicBool,
}

impl FailingUserStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_users: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_user_writes(&self, fail: bool) {
        self.fail_users.store(fail, Ordering::SeqCst);
    }

    fn check(&self, path: &DocPath) -> Result<(), StoreError> {
        if path.collection == "users" && self.fail_users.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("users collection unavailable".into()));
        }
        Ok(())
    }
}

struct FailingTxn<'a> {
    inner: &'a mut dyn TxnContext,
    fail: bool,
}

impl TxnContext for FailingTxn<'_> {
    fn get(&mut self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        self.inner.get(path)
    }

    fn set(&mut self, path: &DocPath, data: Value) -> Result<(), StoreError> {
        if self.fail && path.collection == "users" {
            return Err(StoreError::Backend("users collection unavailable".into()));
        }
        self.inner.set(path, data)
    }

    fn update(&mut self, path: &DocPath, fields: Value) -> Result<(), StoreError> {
        if self.fail && path.collection == "users" {
            return Err(StoreError::Backend("users collection unavailable".into()));
        }
        self.inner.update(path, fields)
    }
}

#[async_trait]
impl DocumentStore for FailingUserStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        self.inner.get(path).await
    }

    async fn set(&self, path: &DocPath, data: Value) -> Result<(), StoreError> {
        self.check(path)?;
        self.inner.set(path, data).await
    }

    async fn update(&self, path: &DocPath, fields: Value) -> Result<(), StoreError> {
        self.check(path)?;
        self.inner.update(path, fields).await
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        self.inner.query(collection, field, value).await
    }

    async fn transaction(&self, op: &mut TxnFn<'_>) -> Result<Value, StoreError> {
        let fail = self.fail_users.load(Ordering::SeqCst);
        self.inner
            .transaction(&mut |txn: &mut dyn TxnContext| -> Result<Value, StoreError> {
                let mut wrapped = FailingTxn { inner: txn, fail };
                op(&mut wrapped)
            })
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.inner.subscribe()
    }
}
