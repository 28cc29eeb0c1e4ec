//! Firestore REST client for the `users` collection.
//!
//! Auth is the service-account flow when a key is configured: an RS256
//! assertion is exchanged for an access token. Without a key the token comes
//! from the instance metadata server. Either way it is cached until a minute
//! before it expires.

use crate::config::{CredentialSource, StoreConfig};
use crate::store::{StoreError, UserPatch, UserRecord, UserStore};
use crate::{logi, snippet};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const USERS: &str = "users";
const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    #[serde(default)]
    pub project_id: Option<String>,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccount {
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw)
            .map_err(|e| StoreError::Credentials(format!("invalid service account JSON: {e}")))
    }

    /// Loads the configured key. `Ok(None)` when no source is configured.
    pub fn load(source: &CredentialSource) -> Result<Option<Self>, StoreError> {
        match source {
            CredentialSource::None => Ok(None),
            CredentialSource::InlineJson(raw) => Self::from_json(raw).map(Some),
            CredentialSource::File(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    StoreError::Credentials(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_json(&raw).map(Some)
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

enum TokenSource {
    ServiceAccount { account: ServiceAccount, key: EncodingKey },
    Metadata { url: String },
}

pub struct FirestoreStore {
    http: Client,
    source: TokenSource,
    documents_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl FirestoreStore {
    /// Builds the client from configuration. A configured key must be
    /// usable; without one the metadata server is used and the project id
    /// has to come from configuration.
    pub fn connect(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let (source, project_id) = match ServiceAccount::load(&cfg.credentials)? {
            Some(account) => {
                let project_id = cfg
                    .project_id
                    .clone()
                    .or_else(|| account.project_id.clone())
                    .ok_or_else(|| StoreError::Credentials("no Firestore project id".to_string()))?;
                let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
                    .map_err(|e| StoreError::Credentials(format!("invalid private key: {e}")))?;
                logi(format!(
                    "Firestore store ready (project={}, account={})",
                    project_id, account.client_email
                ));
                (TokenSource::ServiceAccount { account, key }, project_id)
            }
            None => {
                let project_id = cfg.project_id.clone().ok_or_else(|| {
                    StoreError::Credentials(
                        "no service account configured and no project id for default credentials"
                            .to_string(),
                    )
                })?;
                logi(format!(
                    "Firestore store ready (project={project_id}, default credentials via {})",
                    cfg.metadata_url
                ));
                let url = cfg.metadata_url.trim_end_matches('/').to_string();
                (TokenSource::Metadata { url }, project_id)
            }
        };
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            source,
            documents_url: documents_url(&cfg.base_url, &project_id),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, StoreError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let token = match &self.source {
            TokenSource::ServiceAccount { account, key } => self.exchange_assertion(account, key).await?,
            TokenSource::Metadata { url } => self.metadata_token(url).await?,
        };

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let value = token.access_token;
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        Ok(value)
    }

    async fn exchange_assertion(
        &self,
        account: &ServiceAccount,
        key: &EncodingKey,
    ) -> Result<TokenResponse, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &account.client_email,
            scope: DATASTORE_SCOPE,
            aud: &account.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
            .map_err(|e| StoreError::Auth(format!("cannot sign assertion: {e}")))?;

        let resp = self
            .http
            .post(&account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| StoreError::Auth(e.to_string()))?;
        token_response(resp, "token endpoint").await
    }

    async fn metadata_token(&self, url: &str) -> Result<TokenResponse, StoreError> {
        let resp = self
            .http
            .get(format!("{url}/instance/service-accounts/default/token"))
            .header("Metadata-Flavor", "Google")
            .query(&[("scopes", DATASTORE_SCOPE)])
            .send()
            .await
            .map_err(|e| StoreError::Auth(format!("metadata server unreachable: {e}")))?;
        token_response(resp, "metadata server").await
    }

    fn document_url(&self, uid: &str) -> Result<String, StoreError> {
        if uid.is_empty() || uid.contains('/') {
            return Err(StoreError::Decode(format!("invalid document id {uid:?}")));
        }
        Ok(format!("{}/{}/{}", self.documents_url, USERS, uid))
    }
}

fn documents_url(base_url: &str, project_id: &str) -> String {
    format!(
        "{}/projects/{}/databases/(default)/documents",
        base_url.trim_end_matches('/'),
        project_id
    )
}

async fn token_response(resp: reqwest::Response, issuer: &str) -> Result<TokenResponse, StoreError> {
    let status = resp.status();
    let raw = resp.text().await.map_err(|e| StoreError::Auth(e.to_string()))?;
    if !status.is_success() {
        return Err(StoreError::Auth(format!(
            "{issuer} returned {}: {}",
            status.as_u16(),
            snippet(&raw, 300)
        )));
    }
    serde_json::from_str(&raw).map_err(|e| StoreError::Auth(format!("invalid token response: {e}")))
}

async fn read_body(resp: reqwest::Response) -> Result<(StatusCode, String), StoreError> {
    let status = resp.status();
    let raw = resp
        .text()
        .await
        .map_err(|e| StoreError::Transport(e.to_string()))?;
    Ok((status, raw))
}

fn status_error(status: StatusCode, raw: &str) -> StoreError {
    StoreError::Status {
        status: status.as_u16(),
        body: snippet(raw, 500),
    }
}

#[async_trait]
impl UserStore for FirestoreStore {
    async fn find_by_id(&self, uid: &str) -> Result<Option<UserRecord>, StoreError> {
        let url = self.document_url(uid)?;
        let token = self.access_token().await?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let (status, raw) = read_body(resp).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, &raw));
        }
        let doc: Value = serde_json::from_str(&raw).map_err(|e| StoreError::Decode(e.to_string()))?;
        decode_record(&doc).map(Some)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<(String, UserRecord)>, StoreError> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .post(format!("{}:runQuery", self.documents_url))
            .bearer_auth(token)
            .json(&email_query(email))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let (status, raw) = read_body(resp).await?;
        if !status.is_success() {
            return Err(status_error(status, &raw));
        }
        let rows: Vec<Value> = serde_json::from_str(&raw).map_err(|e| StoreError::Decode(e.to_string()))?;
        for row in rows {
            let Some(doc) = row.get("document") else {
                continue;
            };
            let id = doc
                .get("name")
                .and_then(Value::as_str)
                .and_then(|name| name.rsplit('/').next())
                .unwrap_or_default()
                .to_string();
            return Ok(Some((id, decode_record(doc)?)));
        }
        Ok(None)
    }

    async fn merge(&self, uid: &str, patch: &UserPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let url = self.document_url(uid)?;
        let token = self.access_token().await?;
        let (mask, body) = merge_request(patch);
        let query: Vec<(&str, String)> = mask.into_iter().map(|p| ("updateMask.fieldPaths", p)).collect();
        let resp = self
            .http
            .patch(url)
            .bearer_auth(token)
            .query(&query)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let (status, raw) = read_body(resp).await?;
        if !status.is_success() {
            return Err(status_error(status, &raw));
        }
        Ok(())
    }
}

fn email_query(email: &str) -> Value {
    json!({
        "structuredQuery": {
            "from": [{ "collectionId": USERS }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": "email" },
                    "op": "EQUAL",
                    "value": { "stringValue": email },
                }
            },
            "limit": 1,
        }
    })
}

/// The update mask and document body for a merge write.
fn merge_request(patch: &UserPatch) -> (Vec<String>, Value) {
    let mut mask = Vec::new();
    let mut fields = Map::new();
    for (path, value) in patch.field_writes() {
        mask.push(field_path(&path));
        insert_nested(&mut fields, &path, to_firestore(&value));
    }
    (mask, json!({ "fields": fields }))
}

fn insert_nested(fields: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(head.clone(), value);
        return;
    }
    let entry = fields
        .entry(head.clone())
        .or_insert_with(|| json!({ "mapValue": { "fields": {} } }));
    if let Some(Value::Object(inner)) = entry.pointer_mut("/mapValue/fields") {
        insert_nested(inner, rest, value);
    }
}

/// Joins segments into a Firestore field path, backtick-quoting any segment
/// that is not a plain identifier.
pub fn field_path(segments: &[String]) -> String {
    segments
        .iter()
        .map(|s| {
            let simple = s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if simple {
                s.clone()
            } else {
                format!("`{}`", s.replace('\\', "\\\\").replace('`', "\\`"))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn decode_record(doc: &Value) -> Result<UserRecord, StoreError> {
    let fields = doc.get("fields").cloned().unwrap_or_else(|| json!({}));
    let plain = fields_to_json(&fields);
    serde_json::from_value(plain).map_err(|e| StoreError::Decode(e.to_string()))
}

fn fields_to_json(fields: &Value) -> Value {
    match fields.as_object() {
        Some(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), from_firestore(v))).collect()),
        None => json!({}),
    }
}

/// Converts a typed Firestore value into plain JSON.
pub fn from_firestore(value: &Value) -> Value {
    let Some(map) = value.as_object() else {
        return Value::Null;
    };
    let Some((kind, inner)) = map.iter().next() else {
        return Value::Null;
    };
    match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" | "doubleValue" => inner.clone(),
        "integerValue" => match inner {
            Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or_else(|_| inner.clone()),
            other => other.clone(),
        },
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "mapValue" => fields_to_json(inner.get("fields").unwrap_or(&Value::Null)),
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|vals| vals.iter().map(from_firestore).collect())
                .unwrap_or_default(),
        ),
        _ => inner.clone(),
    }
}

/// Converts plain JSON into a typed Firestore value.
pub fn to_firestore(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({ "arrayValue": { "values": items.iter().map(to_firestore).collect::<Vec<_>>() } }),
        Value::Object(map) => {
            let fields: Map<String, Value> = map.iter().map(|(k, v)| (k.clone(), to_firestore(v))).collect();
            json!({ "mapValue": { "fields": fields } })
        }
    }
}
