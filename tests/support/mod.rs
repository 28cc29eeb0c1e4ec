#![allow(dead_code)]

use async_trait::async_trait;
use creatorflow::api::openrouter::{CallMeta, ChatCompletion, ChatMessage, Completion, CompletionError};
use creatorflow::config::Config;
use creatorflow::server::AppState;
use creatorflow::store::{MemoryStore, UserStore};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const PRIMARY: &str = "test/primary";
pub const FALLBACK: &str = "test/fallback";

/// Replays canned completions in order and records every call.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl ScriptedCompletion {
    pub fn new(replies: Vec<Result<String, CompletionError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<ChatMessage>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatCompletion for ScriptedCompletion {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Completion {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));
        let result = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CompletionError::Request("no scripted reply".into())));
        let status = match &result {
            Ok(_) => 200,
            Err(CompletionError::Upstream { status, .. }) => *status,
            Err(_) => 0,
        };
        Completion {
            result,
            meta: CallMeta {
                status,
                tries: 1,
                latency_ms: 1,
                model: model.to_string(),
            },
        }
    }
}

pub fn upstream_503() -> CompletionError {
    CompletionError::Upstream {
        status: 503,
        body: json!({"error": {"message": "overloaded"}}),
    }
}

pub fn config_with(pairs: &[(&str, &str)]) -> Config {
    let mut map: HashMap<String, String> = [
        ("OPENROUTER_API_KEY", "sk-test"),
        ("OPENROUTER_MODEL_PRIMARY", PRIMARY),
        ("OPENROUTER_MODEL_FALLBACK", FALLBACK),
        ("USER_STORE", "memory"),
        ("PADDLE_ALLOW_UNSIGNED", "true"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in pairs {
        map.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|key| map.get(key).cloned()).unwrap()
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub completions: Arc<ScriptedCompletion>,
}

pub fn harness(config: Config, replies: Vec<Result<String, CompletionError>>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let completions = Arc::new(ScriptedCompletion::new(replies));
    let state = AppState::new(
        config,
        completions.clone() as Arc<dyn ChatCompletion>,
        Some(store.clone() as Arc<dyn UserStore>),
    );
    Harness { state, store, completions }
}
