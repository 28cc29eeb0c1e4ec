use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_RETRY_STATUS: &[u16] = &[408, 409, 425, 429, 500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub debug: bool,
    pub llm: LlmConfig,
    pub billing: BillingConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model_primary: String,
    pub model_fallback: String,
    pub app_public_url: String,
    pub app_title: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub retry_status: Vec<u16>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub webhook_secret: Option<String>,
    pub allow_unsigned_webhooks: bool,
    pub signature_tolerance: Duration,
    pub legacy_amount_credits: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Firestore,
    Memory,
    Disabled,
}

/// Where the service-account key comes from, in priority order. `None`
/// falls back to the instance metadata server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    InlineJson(String),
    File(PathBuf),
    None,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub project_id: Option<String>,
    pub base_url: String,
    pub credentials: CredentialSource,
    /// Root of the compute metadata API, used when no key is configured.
    pub metadata_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let app_public_url = get("APP_PUBLIC_URL").unwrap_or_else(|| "http://127.0.0.1:8000".to_string());

        let llm = LlmConfig {
            api_key: get("OPENROUTER_API_KEY").unwrap_or_default(),
            base_url: get("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            model_primary: get("OPENROUTER_MODEL_PRIMARY").unwrap_or_else(|| "openai/gpt-4o-mini".to_string()),
            model_fallback: get("OPENROUTER_MODEL_FALLBACK")
                .unwrap_or_else(|| "meta-llama/llama-3.1-70b-instruct".to_string()),
            app_public_url,
            app_title: get("OPENROUTER_APP_TITLE").unwrap_or_else(|| "CreatorFlowAI".to_string()),
            connect_timeout: seconds(&get, "LLM_CONNECT_TIMEOUT", 5.0)?,
            read_timeout: seconds(&get, "LLM_READ_TIMEOUT", 60.0)?,
            max_retries: parse_or(&get, "LLM_MAX_RETRIES", 2)?,
            retry_backoff: seconds(&get, "LLM_RETRY_BACKOFF_SECONDS", 0.8)?,
            retry_status: match get("LLM_RETRY_STATUS") {
                Some(raw) => parse_status_list(&raw)?,
                None => DEFAULT_RETRY_STATUS.to_vec(),
            },
            temperature: parse_or(&get, "MODEL_TEMPERATURE", 0.7)?,
            top_p: parse_or(&get, "MODEL_TOP_P", 0.9)?,
            max_tokens: parse_or(&get, "MODEL_MAX_TOKENS", 450)?,
        };

        let billing = BillingConfig {
            webhook_secret: get("PADDLE_WEBHOOK_SECRET"),
            allow_unsigned_webhooks: flag(&get, "PADDLE_ALLOW_UNSIGNED", false)?,
            signature_tolerance: Duration::from_secs(parse_or(&get, "PADDLE_SIGNATURE_TOLERANCE_SECS", 300)?),
            legacy_amount_credits: flag(&get, "PADDLE_LEGACY_AMOUNTS", true)?,
        };

        let backend = match get("USER_STORE").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("firestore") => StoreBackend::Firestore,
            Some("memory") => StoreBackend::Memory,
            Some("disabled") | Some("none") => StoreBackend::Disabled,
            Some(other) => anyhow::bail!("USER_STORE: unsupported backend {other:?}"),
        };

        let store = StoreConfig {
            backend,
            project_id: get("FIRESTORE_PROJECT_ID").or_else(|| get("GOOGLE_CLOUD_PROJECT")),
            base_url: get("FIRESTORE_BASE_URL")
                .unwrap_or_else(|| "https://firestore.googleapis.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            credentials: credential_source(&get),
            metadata_url: format!(
                "http://{}/computeMetadata/v1",
                get("GCE_METADATA_HOST").unwrap_or_else(|| "metadata.google.internal".to_string())
            ),
        };

        Ok(Config {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            debug: flag(&get, "DEBUG", false)?,
            llm,
            billing,
            store,
        })
    }
}

fn credential_source(get: &impl Fn(&str) -> Option<String>) -> CredentialSource {
    if let Some(json) = get("GOOGLE_APPLICATION_CREDENTIALS_JSON") {
        return CredentialSource::InlineJson(json);
    }
    if let Some(value) = get("FIREBASE_SERVICE_ACCOUNT") {
        if value.starts_with('{') {
            return CredentialSource::InlineJson(value);
        }
        return CredentialSource::File(PathBuf::from(value));
    }
    if let Some(path) = get("GOOGLE_APPLICATION_CREDENTIALS") {
        return CredentialSource::File(PathBuf::from(path));
    }
    CredentialSource::None
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw.parse::<T>().with_context(|| format!("{key}: invalid value {raw:?}")),
        None => Ok(default),
    }
}

fn seconds(get: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> Result<Duration> {
    let secs: f64 = parse_or(get, key, default)?;
    if !secs.is_finite() || secs < 0.0 {
        anyhow::bail!("{key}: must be a non-negative number of seconds");
    }
    Ok(Duration::from_secs_f64(secs))
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") | Some("yes") | Some("on") => Ok(true),
        Some("false") | Some("0") | Some("no") | Some("off") => Ok(false),
        Some(other) => anyhow::bail!("{key}: expected a boolean, got {other:?}"),
    }
}

fn parse_status_list(raw: &str) -> Result<Vec<u16>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .with_context(|| format!("LLM_RETRY_STATUS: invalid status code {s:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8000");
        assert!(!cfg.debug);
        assert!(cfg.llm.api_key.is_empty());
        assert_eq!(cfg.llm.model_primary, "openai/gpt-4o-mini");
        assert_eq!(cfg.llm.max_retries, 2);
        assert_eq!(cfg.llm.retry_backoff, Duration::from_millis(800));
        assert_eq!(cfg.llm.retry_status, DEFAULT_RETRY_STATUS.to_vec());
        assert_eq!(cfg.llm.max_tokens, 450);
        assert!(cfg.billing.webhook_secret.is_none());
        assert!(!cfg.billing.allow_unsigned_webhooks);
        assert!(cfg.billing.legacy_amount_credits);
        assert_eq!(cfg.store.backend, StoreBackend::Firestore);
        assert_eq!(cfg.store.credentials, CredentialSource::None);
        assert_eq!(cfg.store.metadata_url, "http://metadata.google.internal/computeMetadata/v1");
        assert_eq!(cfg.store.project_id, None);
    }

    #[test]
    fn default_credentials_settings() {
        let cfg = config_from(&[
            ("GCE_METADATA_HOST", "127.0.0.1:8181"),
            ("GOOGLE_CLOUD_PROJECT", "demo-project"),
        ])
        .unwrap();
        assert_eq!(cfg.store.metadata_url, "http://127.0.0.1:8181/computeMetadata/v1");
        assert_eq!(cfg.store.project_id.as_deref(), Some("demo-project"));

        let cfg = config_from(&[
            ("FIRESTORE_PROJECT_ID", "explicit"),
            ("GOOGLE_CLOUD_PROJECT", "demo-project"),
        ])
        .unwrap();
        assert_eq!(cfg.store.project_id.as_deref(), Some("explicit"));
    }

    #[test]
    fn reads_overrides() {
        let cfg = config_from(&[
            ("DEBUG", "true"),
            ("OPENROUTER_API_KEY", "sk-test"),
            ("OPENROUTER_BASE_URL", "http://localhost:9999/api/"),
            ("LLM_MAX_RETRIES", "4"),
            ("LLM_RETRY_STATUS", "429, 503"),
            ("USER_STORE", "memory"),
            ("PADDLE_WEBHOOK_SECRET", "pdl_secret"),
        ])
        .unwrap();
        assert!(cfg.debug);
        assert_eq!(cfg.llm.api_key, "sk-test");
        assert_eq!(cfg.llm.base_url, "http://localhost:9999/api");
        assert_eq!(cfg.llm.max_retries, 4);
        assert_eq!(cfg.llm.retry_status, vec![429, 503]);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.billing.webhook_secret.as_deref(), Some("pdl_secret"));
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(config_from(&[("LLM_MAX_RETRIES", "many")]).is_err());
        assert!(config_from(&[("DEBUG", "maybe")]).is_err());
        assert!(config_from(&[("LLM_READ_TIMEOUT", "-1")]).is_err());
        assert!(config_from(&[("USER_STORE", "postgres")]).is_err());
    }

    #[test]
    fn credential_sources_follow_priority() {
        let cfg = config_from(&[
            ("GOOGLE_APPLICATION_CREDENTIALS_JSON", "{\"a\":1}"),
            ("FIREBASE_SERVICE_ACCOUNT", "/tmp/sa.json"),
        ])
        .unwrap();
        assert_eq!(cfg.store.credentials, CredentialSource::InlineJson("{\"a\":1}".into()));

        let cfg = config_from(&[("FIREBASE_SERVICE_ACCOUNT", "/tmp/sa.json")]).unwrap();
        assert_eq!(cfg.store.credentials, CredentialSource::File("/tmp/sa.json".into()));

        let cfg = config_from(&[("FIREBASE_SERVICE_ACCOUNT", "{\"b\":2}")]).unwrap();
        assert_eq!(cfg.store.credentials, CredentialSource::InlineJson("{\"b\":2}".into()));

        let cfg = config_from(&[("GOOGLE_APPLICATION_CREDENTIALS", "/etc/key.json")]).unwrap();
        assert_eq!(cfg.store.credentials, CredentialSource::File("/etc/key.json".into()));
    }
}
