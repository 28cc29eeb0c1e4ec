use crate::api::firestore::FirestoreStore;
use crate::api::openrouter::OpenRouterClient;
use crate::config::{Config, StoreBackend, StoreConfig};
use crate::server::AppState;
use crate::store::{MemoryStore, UserStore};
use crate::{logi, logok, logw};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Opens the configured user store. Firestore problems are logged and leave
/// the service running without a store.
pub fn connect_store(cfg: &StoreConfig) -> Option<Arc<dyn UserStore>> {
    match cfg.backend {
        StoreBackend::Disabled => {
            logi("User store disabled");
            None
        }
        StoreBackend::Memory => {
            logw("Using the in-memory user store; records are lost on restart");
            Some(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Firestore => match FirestoreStore::connect(cfg) {
            Ok(store) => {
                logok("Firestore initialized successfully.");
                Some(Arc::new(store))
            }
            Err(e) => {
                logw(format!("Firestore not available in backend: {e}"));
                None
            }
        },
    }
}

/// Wires the OpenRouter client and user store into the shared handler state.
pub fn build_state(config: Config) -> Result<AppState> {
    if config.llm.api_key.is_empty() {
        logw("OPENROUTER_API_KEY is not set; generation requests will fail with SERVER_CONFIG");
    }
    let completions = OpenRouterClient::new(config.llm.clone()).context("OpenRouter client")?;
    let store = connect_store(&config.store);
    Ok(AppState::new(config, Arc::new(completions), store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialSource;

    fn store_config(backend: StoreBackend) -> StoreConfig {
        StoreConfig {
            backend,
            project_id: None,
            base_url: "https://firestore.googleapis.com/v1".into(),
            credentials: CredentialSource::None,
            metadata_url: "http://127.0.0.1:9/computeMetadata/v1".into(),
        }
    }

    #[test]
    fn store_backends() {
        assert!(connect_store(&store_config(StoreBackend::Disabled)).is_none());
        assert!(connect_store(&store_config(StoreBackend::Memory)).is_some());
        assert!(connect_store(&store_config(StoreBackend::Firestore)).is_none());
    }
}
