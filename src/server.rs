//! HTTP surface: script generation, the Paddle webhook and the
//! plan/credit endpoints used by the checkout pages.

use crate::api::openrouter::{ChatCompletion, ModelPair};
use crate::config::{BillingConfig, Config};
use crate::generator::generate_script;
use crate::ledger::{self, LedgerError, Target};
use crate::paddle::{self, SIGNATURE_HEADER, SignatureError};
use crate::plan::Plan;
use crate::prompt::{Brief, text_at};
use crate::store::{UserStore, find_user};
use crate::{loge, logi, logw, snippet};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const MAX_LOGGED_WEBHOOK_CHARS: usize = 4000;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub models: ModelPair,
    pub completions: Arc<dyn ChatCompletion>,
    /// `None` when no user store could be configured.
    pub store: Option<Arc<dyn UserStore>>,
}

impl AppState {
    pub fn new(
        config: Config,
        completions: Arc<dyn ChatCompletion>,
        store: Option<Arc<dyn UserStore>>,
    ) -> Self {
        Self {
            models: ModelPair::from_config(&config.llm),
            config: Arc::new(config),
            completions,
            store,
        }
    }

    fn store(&self) -> Option<&dyn UserStore> {
        self.store.as_deref()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/health/", get(health))
        .route(
            "/api/generate-review/",
            post(generate_review).fallback(only_post),
        )
        .route("/api/paddle-webhook/", post(paddle_webhook))
        .route("/api/confirm-plan/", post(confirm_plan))
        .route("/api/finalize-checkout/", post(finalize_checkout))
        .route("/api/select-basic/", post(select_basic))
        .route("/api/refresh-credits/", post(refresh_credits))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn ok(body: Value) -> Response {
    reply(StatusCode::OK, body)
}

fn bad_request(error: &str) -> Response {
    reply(StatusCode::BAD_REQUEST, json!({ "ok": false, "error": error }))
}

/// Parses a request body that must be a JSON object.
fn parse_object(body: &[u8]) -> Option<Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value).filter(|v| !v.is_empty())
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn only_post() -> Response {
    reply(
        StatusCode::METHOD_NOT_ALLOWED,
        json!({ "error": "Only POST allowed." }),
    )
}

async fn generate_review(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(payload) = parse_object(&body) else {
        return reply(StatusCode::BAD_REQUEST, json!({ "error": "Invalid JSON body." }));
    };

    let brief = Brief::from_json(&payload);
    let uid = text_at(&payload, "uid");
    let email = text_at(&payload, "email");

    let record = find_user(state.store(), non_empty(&uid), non_empty(&email)).await;
    let premium = record.and_then(|r| r.plan()) == Some(Plan::Premium);

    match generate_script(state.completions.as_ref(), &state.models, &brief, premium).await {
        Ok(script) => ok(json!({ "response": script.text, "meta": script.meta })),
        Err(failure) => {
            let mut payload = json!({ "error": "Upstream model failed", "meta": failure.meta });
            if state.config.debug {
                payload["upstream"] = failure.to_json(true);
            }
            reply(StatusCode::BAD_GATEWAY, payload)
        }
    }
}

fn authenticate(billing: &BillingConfig, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
    let Some(secret) = billing.webhook_secret.as_deref() else {
        return if billing.allow_unsigned_webhooks {
            Ok(())
        } else {
            Err(SignatureError::MissingSecret)
        };
    };
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(SignatureError::MissingHeader)?;
    paddle::verify_signature(
        secret,
        header,
        body,
        chrono::Utc::now().timestamp(),
        billing.signature_tolerance,
    )
}

async fn paddle_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(e) = authenticate(&state.config.billing, &headers, &body) {
        logw(format!("Webhook rejected: {e}"));
        return reply(
            StatusCode::UNAUTHORIZED,
            json!({ "ok": false, "error": "invalid_signature" }),
        );
    }

    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        match parse_object(&body) {
            Some(payload) => payload,
            None => {
                logw("Webhook: invalid JSON");
                return reply(StatusCode::BAD_REQUEST, json!({}));
            }
        }
    };

    logi(format!(
        "Paddle webhook payload: {}",
        snippet(&String::from_utf8_lossy(&body), MAX_LOGGED_WEBHOOK_CHARS)
    ));

    let (event_type, data) = paddle::unwrap_event(&payload);
    if !paddle::is_handled_event(&event_type) {
        return ok(json!({ "ok": true, "ignored": event_type }));
    }

    let purchase = paddle::interpret(data, state.config.billing.legacy_amount_credits);
    logi(format!(
        "Parsed -> event={} uid={:?} email={:?} plan={:?} credits={} txn={:?}",
        event_type, purchase.uid, purchase.email, purchase.plan, purchase.credits, purchase.transaction_id
    ));

    let Some(plan) = purchase.plan else {
        logw("Webhook: could not detect plan from payload; skipping update.");
        return ok(json!({ "ok": true, "ignored": "unknown_plan" }));
    };

    let updated = ledger::apply_plan_to_user(
        state.store(),
        purchase.uid.as_deref(),
        purchase.email.as_deref(),
        plan,
        Some(purchase.credits).filter(|c| *c > 0),
        purchase.transaction_id.as_deref(),
    )
    .await;

    if !updated {
        logw(format!(
            "Webhook: no matching user for uid={:?} email={:?}",
            purchase.uid, purchase.email
        ));
        return ok(json!({ "ok": true, "no_user": true }));
    }
    ok(json!({ "ok": true }))
}

async fn confirm_plan(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(payload) = parse_object(&body) else {
        return bad_request("invalid_json");
    };
    let uid = text_at(&payload, "uid");
    let plan = Plan::parse(&text_at(&payload, "plan"));
    let (Some(uid), Ok(plan)) = (non_empty(&uid), plan) else {
        return bad_request("bad_uid_or_plan");
    };

    let updated = ledger::apply_plan(
        state.store(),
        Target::ByUid(uid),
        plan,
        Some(plan.credit_pack()),
        None,
    )
    .await;
    ok(json!({ "ok": updated }))
}

async fn finalize_checkout(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(payload) = parse_object(&body) else {
        return bad_request("invalid_json");
    };
    let uid = text_at(&payload, "uid");
    let email = text_at(&payload, "email");
    let txn = text_at(&payload, "transaction_id");

    let Ok(plan) = Plan::parse(&text_at(&payload, "plan")) else {
        return bad_request("invalid_plan");
    };
    if uid.is_empty() && email.is_empty() {
        return bad_request("uid_or_email_required");
    }

    let updated = ledger::apply_plan_to_user(
        state.store(),
        non_empty(&uid),
        non_empty(&email),
        plan,
        Some(plan.credit_pack()),
        non_empty(&txn),
    )
    .await;
    ok(json!({ "ok": updated }))
}

async fn select_basic(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(payload) = parse_object(&body) else {
        return bad_request("invalid_json");
    };
    let uid = text_at(&payload, "uid");
    let email = text_at(&payload, "email");
    if uid.is_empty() && email.is_empty() {
        return bad_request("uid_or_email_required");
    }

    let updated = ledger::apply_plan_to_user(
        state.store(),
        non_empty(&uid),
        non_empty(&email),
        Plan::Basic,
        None,
        None,
    )
    .await;
    ok(json!({ "ok": updated }))
}

async fn refresh_credits(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(payload) = parse_object(&body) else {
        return bad_request("invalid_json");
    };
    let uid = text_at(&payload, "uid");
    let email = text_at(&payload, "email");
    if uid.is_empty() && email.is_empty() {
        return bad_request("uid_or_email_required");
    }
    let Some(store) = state.store() else {
        return reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "ok": false, "error": "fs_unavailable" }),
        );
    };

    let target = match non_empty(&uid) {
        Some(uid) => Target::ByUid(uid),
        None => Target::ByEmail(&email),
    };
    match ledger::refresh_credits(store, target, chrono::Utc::now()).await {
        Ok(updated) => ok(json!({ "ok": true, "updated": updated })),
        Err(LedgerError::UserNotFound(_)) => ok(json!({ "ok": false, "updated": false })),
        Err(e) => {
            loge(format!("Credit refresh for {target:?} failed: {e}"));
            ok(json!({ "ok": false, "updated": false }))
        }
    }
}
