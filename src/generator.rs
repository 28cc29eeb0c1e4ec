use crate::api::openrouter::{
    CallMeta, ChatCompletion, ChatMessage, GenerationFailure, ModelPair, generate_with_fallback,
};
use crate::prompt::{self, Brief};
use crate::script;
use crate::{logi, logw, snippet};
use serde::Serialize;

const MAX_LOGGED_SCRIPT_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageMeta {
    #[serde(flatten)]
    pub call: CallMeta,
    pub reforged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScriptMeta {
    SingleShot(CallMeta),
    PremiumStepwise {
        hook: StageMeta,
        body: StageMeta,
        cta: StageMeta,
    },
}

#[derive(Debug, Clone)]
pub struct Script {
    pub text: String,
    pub meta: ScriptMeta,
}

/// One stepwise section: how it is asked for, cleaned up, judged and
/// rewritten.
struct Section {
    name: &'static str,
    label: &'static str,
    system: &'static str,
    reforge_system: &'static str,
    reforge_ask: &'static str,
    tighten: fn(&str) -> String,
    needs_reforge: fn(&str) -> bool,
}

const HOOK: Section = Section {
    name: "hook",
    label: "Hook",
    system: prompt::HOOK_SYSTEM_PROMPT,
    reforge_system: prompt::REFORGE_HOOK_SYSTEM_PROMPT,
    reforge_ask: "Rewrite this into a direct, second-person, highly relatable one-liner (8–16 words), no generic questions:",
    tighten: script::tighten_hook,
    needs_reforge: script::hook_needs_reforge,
};

const BODY: Section = Section {
    name: "body",
    label: "Body",
    system: prompt::BODY_SYSTEM_PROMPT,
    reforge_system: prompt::REFORGE_BODY_SYSTEM_PROMPT,
    reforge_ask: "Rewrite this Body to be more human, persuasive, and concrete (60–90 words):",
    tighten: script::tighten_body,
    needs_reforge: script::body_needs_reforge,
};

const CTA: Section = Section {
    name: "cta",
    label: "CTA",
    system: prompt::CTA_SYSTEM_PROMPT,
    reforge_system: prompt::REFORGE_CTA_SYSTEM_PROMPT,
    reforge_ask: "Rewrite this CTA to be imperative, viewer-directed, and specific:",
    tighten: script::tighten_cta,
    needs_reforge: script::cta_needs_reforge,
};

struct StageFailure {
    stage: &'static str,
    failure: GenerationFailure,
}

async fn run_section(
    client: &dyn ChatCompletion,
    models: &ModelPair,
    section: &Section,
    brief_prompt: &str,
    user: String,
) -> Result<(String, StageMeta), StageFailure> {
    let messages = [ChatMessage::system(section.system), ChatMessage::user(user)];
    let generated = generate_with_fallback(client, models, &messages)
        .await
        .map_err(|failure| StageFailure { stage: section.name, failure })?;

    let mut text = (section.tighten)(&generated.text);
    let mut reforged = false;

    if (section.needs_reforge)(&text) {
        logi(format!("{} failed the quality gate; reforging: {:?}", section.label, text));
        let ask = format!(
            "{brief_prompt}\n\n{}\n{}: {text}",
            section.reforge_ask, section.label
        );
        let messages = [ChatMessage::system(section.reforge_system), ChatMessage::user(ask)];
        match generate_with_fallback(client, models, &messages).await {
            Ok(rewrite) => {
                text = (section.tighten)(&rewrite.text);
                reforged = true;
            }
            Err(e) => logw(format!(
                "{} reforge failed ({} / {}); keeping the tightened text",
                section.label,
                e.primary.code(),
                e.fallback.code()
            )),
        }
    }

    Ok((text, StageMeta { call: generated.meta, reforged }))
}

/// Hook, then Body conditioned on the Hook, then CTA conditioned on the Body.
async fn generate_stepwise(
    client: &dyn ChatCompletion,
    models: &ModelPair,
    brief_prompt: &str,
) -> Result<Script, StageFailure> {
    let (hook, hook_meta) = run_section(client, models, &HOOK, brief_prompt, brief_prompt.to_string()).await?;

    let body_ask = format!("{brief_prompt}\n\nUse this Hook (do not repeat it verbatim):\n{hook}");
    let (body, body_meta) = run_section(client, models, &BODY, brief_prompt, body_ask).await?;

    let cta_ask = format!("{brief_prompt}\n\nHere is the Body to build a CTA for:\n{body}");
    let (cta, cta_meta) = run_section(client, models, &CTA, brief_prompt, cta_ask).await?;

    Ok(Script {
        text: script::join_sections(&hook, &body, &cta),
        meta: ScriptMeta::PremiumStepwise {
            hook: hook_meta,
            body: body_meta,
            cta: cta_meta,
        },
    })
}

async fn generate_single_shot(
    client: &dyn ChatCompletion,
    models: &ModelPair,
    brief_prompt: &str,
) -> Result<Script, GenerationFailure> {
    let messages = [
        ChatMessage::system(prompt::SYSTEM_PROMPT),
        ChatMessage::user(brief_prompt),
    ];
    let generated = generate_with_fallback(client, models, &messages).await?;
    Ok(Script {
        text: script::normalize_sections(generated.text.trim()),
        meta: ScriptMeta::SingleShot(generated.meta),
    })
}

/// Generates a script for `brief`. Premium callers get the stepwise
/// pipeline; any stage failure there falls through to a single-shot call.
pub async fn generate_script(
    client: &dyn ChatCompletion,
    models: &ModelPair,
    brief: &Brief,
    premium: bool,
) -> Result<Script, GenerationFailure> {
    let brief_prompt = brief.user_prompt();

    if premium {
        match generate_stepwise(client, models, &brief_prompt).await {
            Ok(script) => {
                logi(format!(
                    "Premium stepwise content: {:?}",
                    snippet(&script.text, MAX_LOGGED_SCRIPT_CHARS)
                ));
                return Ok(script);
            }
            Err(StageFailure { stage, failure }) => logw(format!(
                "Stepwise failed at {stage}; falling back to single-shot. primary={} ({}) fallback={} ({})",
                failure.primary.code(),
                failure.primary,
                failure.fallback.code(),
                failure.fallback
            )),
        }
    }

    let script = generate_single_shot(client, models, &brief_prompt).await?;
    logi(format!(
        "Final cleaned content (single-shot): {:?}",
        snippet(&script.text, MAX_LOGGED_SCRIPT_CHARS)
    ));
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(model: &str) -> CallMeta {
        CallMeta { status: 200, tries: 1, latency_ms: 12, model: model.to_string() }
    }

    #[test]
    fn single_shot_meta_is_flat() {
        let meta = serde_json::to_value(ScriptMeta::SingleShot(call("m1"))).unwrap();
        assert_eq!(
            meta,
            json!({"mode": "single_shot", "status": 200, "tries": 1, "latency_ms": 12, "model": "m1"})
        );
    }

    #[test]
    fn stepwise_meta_tags_each_stage() {
        let stage = |reforged| StageMeta { call: call("m1"), reforged };
        let meta = serde_json::to_value(ScriptMeta::PremiumStepwise {
            hook: stage(true),
            body: stage(false),
            cta: stage(false),
        })
        .unwrap();
        assert_eq!(meta["mode"], "premium_stepwise");
        assert_eq!(meta["hook"]["reforged"], true);
        assert_eq!(meta["hook"]["model"], "m1");
        assert_eq!(meta["cta"]["tries"], 1);
    }
}
