//! User records, the merge patch written against them and the storage seam.
//!
//! Documents live under `users/{uid}`. Reads are lenient (missing or null
//! fields default, numbers stored as doubles or strings are accepted) and
//! writes are merges: only the fields a patch names are touched.

use crate::logw;
use crate::plan::Plan;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRecord {
    #[serde(deserialize_with = "null_as_default")]
    pub email: String,
    pub subscription_plan: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    pub subscription_selected: bool,
    #[serde(deserialize_with = "lenient_int")]
    pub credits: i64,
    #[serde(deserialize_with = "lenient_bool")]
    pub free_basic_granted: bool,
    #[serde(deserialize_with = "truthy_map")]
    pub processed_txns: BTreeMap<String, bool>,
    pub last_paid_txn: Option<String>,
    pub credit_depleted_at: Option<String>,
}

impl UserRecord {
    /// The stored plan label, if it names a known plan.
    pub fn plan(&self) -> Option<Plan> {
        self.subscription_plan
            .as_deref()
            .and_then(|label| Plan::parse(label).ok())
    }

    pub fn has_processed(&self, txn: &str) -> bool {
        self.processed_txns.get(txn).copied().unwrap_or(false)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or_default(),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64))
                .unwrap_or_default()
        }
        _ => 0,
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(is_truthy(&Value::deserialize(deserializer)?))
}

fn truthy_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<String, bool>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let Value::Object(map) = value else {
        return Ok(BTreeMap::new());
    };
    Ok(map.iter().map(|(k, v)| (k.clone(), is_truthy(v))).collect())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// A staged merge write. `None` leaves the stored field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub subscription_selected: Option<bool>,
    pub subscription_plan: Option<Plan>,
    pub credits: Option<i64>,
    pub free_basic_granted: Option<bool>,
    /// Marks `processedTxns.<id>` without rewriting the rest of the map.
    pub processed_txn: Option<String>,
    pub last_paid_txn: Option<String>,
    /// `Some(None)` clears the stored timestamp.
    pub credit_depleted_at: Option<Option<String>>,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool {
        self == &UserPatch::default()
    }

    pub fn apply_to(&self, record: &mut UserRecord) {
        if let Some(selected) = self.subscription_selected {
            record.subscription_selected = selected;
        }
        if let Some(plan) = self.subscription_plan {
            record.subscription_plan = Some(plan.as_str().to_string());
        }
        if let Some(credits) = self.credits {
            record.credits = credits;
        }
        if let Some(granted) = self.free_basic_granted {
            record.free_basic_granted = granted;
        }
        if let Some(txn) = &self.processed_txn {
            record.processed_txns.insert(txn.clone(), true);
        }
        if let Some(txn) = &self.last_paid_txn {
            record.last_paid_txn = Some(txn.clone());
        }
        if let Some(depleted) = &self.credit_depleted_at {
            record.credit_depleted_at = depleted.clone();
        }
    }

    /// Field paths (as segments) and plain JSON values, in a stable order.
    pub fn field_writes(&self) -> Vec<(Vec<String>, Value)> {
        let mut out = Vec::new();
        let mut push = |path: &[&str], value: Value| {
            out.push((path.iter().map(|s| s.to_string()).collect(), value));
        };
        if let Some(selected) = self.subscription_selected {
            push(&["subscriptionSelected"], json!(selected));
        }
        if let Some(plan) = self.subscription_plan {
            push(&["subscriptionPlan"], json!(plan.as_str()));
        }
        if let Some(credits) = self.credits {
            push(&["credits"], json!(credits));
        }
        if let Some(granted) = self.free_basic_granted {
            push(&["freeBasicGranted"], json!(granted));
        }
        if let Some(txn) = &self.processed_txn {
            push(&["processedTxns", txn.as_str()], json!(true));
        }
        if let Some(txn) = &self.last_paid_txn {
            push(&["lastPaidTxn"], json!(txn));
        }
        if let Some(depleted) = &self.credit_depleted_at {
            push(&["creditDepletedAt"], json!(depleted));
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store credentials unusable: {0}")]
    Credentials(String),
    #[error("store auth failed: {0}")]
    Auth(String),
    #[error("store request failed: {0}")]
    Transport(String),
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed store document: {0}")]
    Decode(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Exact document lookup. A missing document is `Ok(None)`.
    async fn find_by_id(&self, uid: &str) -> Result<Option<UserRecord>, StoreError>;

    /// First document whose `email` equals `email`, with its id.
    async fn find_by_email(&self, email: &str) -> Result<Option<(String, UserRecord)>, StoreError>;

    /// Merge write. Creates the document when it does not exist.
    async fn merge(&self, uid: &str, patch: &UserPatch) -> Result<(), StoreError>;
}

/// Resolves a user by uid, then by email. Store failures read as "no record".
pub async fn find_user(
    store: Option<&dyn UserStore>,
    uid: Option<&str>,
    email: Option<&str>,
) -> Option<UserRecord> {
    let store = store?;

    if let Some(uid) = uid.filter(|u| !u.is_empty()) {
        match store.find_by_id(uid).await {
            Ok(Some(record)) => return Some(record),
            Ok(None) => {}
            Err(e) => logw(format!("User lookup by uid failed: {e}")),
        }
    }

    if let Some(email) = email.filter(|e| !e.is_empty()) {
        match store.find_by_email(email).await {
            Ok(Some((_, record))) => return Some(record),
            Ok(None) => {}
            Err(e) => logw(format!("User lookup by email failed: {e}")),
        }
    }

    None
}

/// Process-local store for development and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<String, UserRecord>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uid: impl Into<String>, record: UserRecord) {
        self.users.insert(uid.into(), record);
    }

    pub fn get(&self, uid: &str) -> Option<UserRecord> {
        self.users.get(uid).map(|r| r.value().clone())
    }

    /// Number of merge writes applied so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_id(&self, uid: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.get(uid))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<(String, UserRecord)>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|entry| entry.value().email == email)
            .map(|entry| (entry.key().clone(), entry.value().clone())))
    }

    async fn merge(&self, uid: &str, patch: &UserPatch) -> Result<(), StoreError> {
        let mut record = self.users.entry(uid.to_string()).or_default();
        patch.apply_to(record.value_mut());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
