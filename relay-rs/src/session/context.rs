//! Per-session diagnostic context
//!
//! Two layers of log fields: a base layer fixed for the connection (peer
//! address, authenticated identity) and a transaction layer (sender,
//! recipients, delivery id) that is dropped whenever the transaction resets.
//! Reads see the union, with transaction values winning on collision.

use std::collections::BTreeMap;
use std::fmt;

/// Field names used by the relay; each is logged under its own key
pub mod fields {
    pub const SERVICE: &str = "service";
    pub const CLIENT_IP: &str = "client_ip";
    pub const CLIENT_PORT: &str = "client_port";
    pub const CLIENT_USERNAME: &str = "client_username";
    pub const FROM: &str = "from";
    pub const RECIPIENTS: &str = "recipients";
    pub const DELIVERY_ID: &str = "delivery_id";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(text) => f.write_str(text),
            FieldValue::List(items) => write!(f, "[{}]", items.join(",")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticContext {
    base: BTreeMap<&'static str, FieldValue>,
    transaction: BTreeMap<&'static str, FieldValue>,
}

impl DiagnosticContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`set_base`](Self::set_base)
    pub fn with_base(mut self, key: &'static str, value: impl Into<FieldValue>) -> Self {
        self.set_base(key, value);
        self
    }

    /// Connection-scoped field, survives transaction resets
    pub fn set_base(&mut self, key: &'static str, value: impl Into<FieldValue>) {
        self.base.insert(key, value.into());
    }

    /// Transaction-scoped field
    pub fn set(&mut self, key: &'static str, value: impl Into<FieldValue>) {
        self.transaction.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.transaction.get(key).or_else(|| self.base.get(key))
    }

    /// Rendered value of `key`, as written to the log
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).map(ToString::to_string)
    }

    /// Union of both layers
    pub fn fields(&self) -> BTreeMap<&'static str, &FieldValue> {
        let mut merged: BTreeMap<&'static str, &FieldValue> =
            self.base.iter().map(|(k, v)| (*k, v)).collect();
        for (k, v) in &self.transaction {
            merged.insert(*k, v);
        }
        merged
    }

    /// Drop the transaction layer
    pub fn clear_transaction(&mut self) {
        self.transaction.clear();
    }

    pub fn has_transaction_fields(&self) -> bool {
        !self.transaction.is_empty()
    }
}
