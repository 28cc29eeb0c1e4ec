//! Paddle webhook verification and payload interpretation.
//!
//! Payload shapes differ across event families, so every lookup here is
//! defensive: missing or mistyped fields read as absent.

use crate::plan::Plan;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Paddle-Signature";

/// Event types that can carry a plan purchase.
pub const HANDLED_EVENTS: &[&str] = &[
    "transaction.completed",
    "subscription.activated",
    "subscription.payment_succeeded",
    "checkout.completed",
];

pub fn is_handled_event(event_type: &str) -> bool {
    HANDLED_EVENTS.contains(&event_type)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("webhook secret not configured")]
    MissingSecret,
    #[error("missing {SIGNATURE_HEADER} header")]
    MissingHeader,
    #[error("malformed {SIGNATURE_HEADER} header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

fn mac_hex(secret: &str, ts: &str, body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(ts.as_bytes());
    mac.update(b":");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Builds a `Paddle-Signature` header value for `body` signed at `ts`.
pub fn signature_header(secret: &str, ts: i64, body: &[u8]) -> Result<String, SignatureError> {
    let ts = ts.to_string();
    Ok(format!("ts={};h1={}", ts, mac_hex(secret, &ts, body)?))
}

/// Checks `ts=<unix>;h1=<hex>` against the raw body. Any `h1` entry may
/// match (Paddle sends several while a secret is rotating). A zero
/// tolerance skips the timestamp check.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now_unix: i64,
    tolerance: Duration,
) -> Result<(), SignatureError> {
    let mut ts = None;
    let mut candidates = Vec::new();
    for part in header.split(';') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "ts" => ts = Some(value),
            "h1" => candidates.push(value),
            _ => {}
        }
    }
    let ts = ts.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let ts_unix: i64 = ts.parse().map_err(|_| SignatureError::Malformed)?;
    if !tolerance.is_zero() && now_unix.abs_diff(ts_unix) > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    let expected = mac_hex(secret, ts, body)?;
    let matched = candidates
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));
    if matched { Ok(()) } else { Err(SignatureError::Mismatch) }
}

/// Splits an envelope into its event type and data object.
pub fn unwrap_event(payload: &Value) -> (String, &Value) {
    let event = payload.get("event").filter(|e| e.is_object()).unwrap_or(payload);
    let event_type = ["event_type", "type", "name"]
        .iter()
        .find_map(|key| event.get(*key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string();
    let data = ["data", "object"]
        .iter()
        .find_map(|key| event.get(*key).filter(|d| d.is_object()))
        .unwrap_or(payload);
    (event_type, data)
}

/// Decodes the opaque passthrough token: a JSON object, a JSON string, or a
/// base64-encoded JSON string. Anything else reads as an empty mapping.
pub fn decode_passthrough(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
                return map;
            }
            STANDARD
                .decode(raw)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
                .and_then(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .unwrap_or_default()
        }
        _ => Map::new(),
    }
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn passthrough_of(data: &Value) -> Map<String, Value> {
    [
        &["passthrough"][..],
        &["checkout", "passthrough"][..],
        &["transaction", "passthrough"][..],
    ]
    .iter()
    .find_map(|path| {
        path.iter()
            .try_fold(data, |v, key| v.get(*key))
            .filter(|v| !v.is_null() && v.as_str() != Some(""))
    })
    .map(decode_passthrough)
    .unwrap_or_default()
}

fn map_str(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Infers a plan from price or product names. "premium" wins over "pro".
pub fn infer_plan_from_names(data: &Value) -> Option<Plan> {
    let names = [
        data.get("items")
            .and_then(|items| items.get(0))
            .and_then(|item| str_at(item, &["price", "name"])),
        data.get("details")
            .and_then(|d| d.get("line_items"))
            .and_then(|items| items.get(0))
            .and_then(|item| str_at(item, &["product", "name"])),
    ];
    names.into_iter().flatten().find_map(|name| {
        let name = name.to_lowercase();
        if name.contains("premium") {
            Some(Plan::Premium)
        } else if name.contains("pro") {
            Some(Plan::Pro)
        } else {
            None
        }
    })
}

const LEGACY_PRO_TOTALS: [f64; 4] = [646.0, 6.46, 575.0, 5.75];
const LEGACY_PREMIUM_TOTALS: [f64; 2] = [1669.0, 16.69];

/// Sandbox grand totals, in minor or major units, that predate plan labels.
fn legacy_amount_credits(amount: &Value) -> i64 {
    let total = match amount {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let Some(total) = total else {
        return 0;
    };
    let is_one_of = |totals: &[f64]| totals.iter().any(|t| (t - total).abs() < 1e-9);
    if is_one_of(&LEGACY_PRO_TOTALS) {
        Plan::Pro.credit_pack()
    } else if is_one_of(&LEGACY_PREMIUM_TOTALS) {
        Plan::Premium.credit_pack()
    } else {
        0
    }
}

/// Credits to grant for an event. Paid plans map to their pack; otherwise
/// the legacy sandbox totals apply when enabled. Zero means "plan default".
pub fn detect_credits(plan: Option<Plan>, data: &Value, legacy_amounts: bool) -> i64 {
    match plan {
        Some(Plan::Pro) => return Plan::Pro.credit_pack(),
        Some(Plan::Premium) => return Plan::Premium.credit_pack(),
        _ => {}
    }
    if !legacy_amounts {
        return 0;
    }
    ["details", "totals", "grand_total"]
        .iter()
        .try_fold(data, |v, key| v.get(*key))
        .map(legacy_amount_credits)
        .unwrap_or(0)
}

/// The id used to guard a paid grant against redelivery.
pub fn transaction_id(data: &Value) -> Option<String> {
    str_at(data, &["id"])
        .filter(|id| id.starts_with("txn_"))
        .or_else(|| str_at(data, &["transaction_id"]))
        .map(str::to_string)
}

/// Everything the ledger needs from one billing event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Purchase {
    pub uid: Option<String>,
    pub email: Option<String>,
    pub plan: Option<Plan>,
    pub credits: i64,
    pub transaction_id: Option<String>,
}

pub fn interpret(data: &Value, legacy_amounts: bool) -> Purchase {
    let passthrough = passthrough_of(data);

    let uid = map_str(&passthrough, "uid").or_else(|| str_at(data, &["custom_data", "uid"]).map(str::to_string));

    let email = str_at(data, &["customer", "email"])
        .or_else(|| str_at(data, &["customer_email"]))
        .or_else(|| str_at(data, &["billing_details", "email"]))
        .map(str::to_string)
        .or_else(|| map_str(&passthrough, "email"))
        .or_else(|| str_at(data, &["custom_data", "email"]).map(str::to_string));

    let label = str_at(data, &["custom_data", "plan"])
        .or_else(|| str_at(data, &["metadata", "plan"]))
        .map(str::to_string)
        .or_else(|| map_str(&passthrough, "plan"));
    let plan = label
        .and_then(|l| Plan::parse(&l).ok())
        .or_else(|| infer_plan_from_names(data));

    Purchase {
        uid,
        email,
        plan,
        credits: detect_credits(plan, data, legacy_amounts),
        transaction_id: transaction_id(data),
    }
}
