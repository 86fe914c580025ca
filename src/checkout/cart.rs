// Customer session and cart

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Signed-in customer as supplied by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub uid: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Identity {
    /// Name shown on the order; falls back to the email.
    pub fn name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOn {
    pub id: String,
    pub name: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    #[serde(default)]
    pub id: String,
    pub product_id: String,
    pub name: String,
    pub price: Decimal,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default)]
    pub add_ons: BTreeMap<String, AddOn>,
}

impl CartItem {
    pub fn new(product_id: impl Into<String>, name: impl Into<String>, price: Decimal) -> Self {
        Self {
            id: String::new(),
            product_id: product_id.into(),
            name: name.into(),
            price,
            quantity: 1,
            size: None,
            add_ons: BTreeMap::new(),
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_add_on(mut self, id: impl Into<String>, name: impl Into<String>, price: Decimal) -> Self {
        let id = id.into();
        self.add_ons.insert(
            id.clone(),
            AddOn {
                id,
                name: name.into(),
                price,
            },
        );
        self
    }

    /// Price of one unit including add-ons.
    pub fn unit_price(&self) -> Decimal {
        self.price + self.add_ons.values().map(|a| a.price).sum::<Decimal>()
    }

    pub fn line_total(&self) -> Decimal {
        self.unit_price() * Decimal::from(self.quantity)
    }

    fn same_line(&self, other: &CartItem) -> bool {
        self.product_id == other.product_id
            && self.size == other.size
            && self.add_ons.keys().eq(other.add_ons.keys())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    items: Vec<CartItem>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `item`, merging it into a line with the same product, size and
    /// add-ons. Returns the id of the affected line.
    pub fn add_item(&mut self, mut item: CartItem) -> String {
        if item.quantity == 0 {
            item.quantity = 1;
        }
        if let Some(line) = self.items.iter_mut().find(|line| line.same_line(&item)) {
            line.quantity = line.quantity.saturating_add(item.quantity);
            return line.id.clone();
        }
        if item.id.is_empty() {
            item.id = Uuid::new_v4().to_string();
        }
        let id = item.id.clone();
        self.items.push(item);
        id
    }

    pub fn remove_item(&mut self, item_id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|line| line.id != item_id);
        self.items.len() != before
    }

    /// Set the quantity of a line; zero or less removes it.
    pub fn update_quantity(&mut self, item_id: &str, quantity: i64) -> bool {
        if quantity <= 0 {
            return self.remove_item(item_id);
        }
        match self.items.iter_mut().find(|line| line.id == item_id) {
            Some(line) => {
                line.quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of units across all lines.
    pub fn item_count(&self) -> u32 {
        self.items
            .iter()
            .fold(0u32, |acc, line| acc.saturating_add(line.quantity))
    }

    pub fn total(&self) -> Decimal {
        self.items.iter().map(CartItem::line_total).sum()
    }
}

/// Everything a checkout needs about one signed-in customer.
#[derive(Debug, Clone)]
pub struct CustomerSession {
    pub identity: Identity,
    pub cart: Cart,
    applied_voucher: Option<String>,
}

impl CustomerSession {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            cart: Cart::new(),
            applied_voucher: None,
        }
    }

    pub fn apply_voucher(&mut self, code: impl Into<String>) {
        let code = code.into();
        let code = code.trim();
        self.applied_voucher = (!code.is_empty()).then(|| code.to_string());
    }

    pub fn applied_voucher(&self) -> Option<&str> {
        self.applied_voucher.as_deref()
    }

    pub fn clear_voucher(&mut self) {
        self.applied_voucher = None;
    }
}
