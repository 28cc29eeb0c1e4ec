//! Post-processing for generated scripts: label cleanup, per-section
//! tightening and the heuristic quality gates that decide on a reforge.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use regex::Regex;

pub const HOOK_MAX_WORDS: usize = 16;
pub const BODY_MAX_WORDS: usize = 80;
pub const CTA_MAX_WORDS: usize = 20;

macro_rules! cached_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> Result<&'static Regex> {
            static RE: OnceCell<Regex> = OnceCell::new();
            RE.get_or_try_init(|| {
                Regex::new($pattern).context(concat!("failed to compile ", stringify!($name)))
            })
        }
    };
}

cached_regex!(
    generic_q_re,
    r"(?i)\b(ever wonder|have you ever|are you( a)?|did you know|in today'?s (video|reel)|in this video|let'?s dive in)\b"
);
cached_regex!(you_re, r"(?i)\byou(?:r|’re|'re|\b)");
cached_regex!(
    action_verbs_re,
    r"(?i)\b(save|comment|follow|dm|share|tap|try|use|apply|post|record|write|build|launch|fix|download|grab|join|watch|bookmark)\b"
);
cached_regex!(md_noise_re, r"[*_`>#~]+");
cached_regex!(trailing_undefined_re, r"(?is)(?:\s*\bundefined\b\s*)+\z");
cached_regex!(first_sentence_re, r"^(.+?[.!?])(\s|$)");
cached_regex!(bullet_re, r"(?m)^[\-\*\u{2022}]\s*");
cached_regex!(whitespace_re, r"\s+");
cached_regex!(open_fence_re, r"\A```\w*\n");
cached_regex!(close_fence_re, r"\n```[ \t]*\n?\z");
cached_regex!(hook_label_re, r"(?im)^[ \t]*(?:hok|hook)[ \t]*:");
cached_regex!(body_label_re, r"(?im)^[ \t]*body[ \t]*:");
cached_regex!(cta_label_re, r"(?im)^[ \t]*cta[ \t]*:");
cached_regex!(after_hook_re, r"(?is)\bHook\s*:\s*(.*)");
cached_regex!(after_body_re, r"(?is)\bBody\s*:\s*(.*)");
cached_regex!(after_cta_re, r"(?is)\bCTA\s*:\s*(.*)");

/// Runs `replace_all` when the pattern is available; otherwise the text
/// passes through unchanged.
fn replace_all(re: Result<&Regex>, text: &str, rep: &str) -> String {
    match re {
        Ok(re) => re.replace_all(text, rep).into_owned(),
        Err(_) => text.to_string(),
    }
}

fn matches(re: Result<&Regex>, text: &str) -> bool {
    re.is_ok_and(|re| re.is_match(text))
}

/// Repairs the usual model slip-ups in a full `Hook/Body/CTA` script.
pub fn normalize_sections(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let t = text.replace("\r\n", "\n").replace('\r', "\n");
    let t = replace_all(open_fence_re(), &t, "");
    let t = replace_all(close_fence_re(), &t, "");
    let t = replace_all(hook_label_re(), &t, "Hook:");
    let t = replace_all(body_label_re(), &t, "Body:");
    let t = replace_all(cta_label_re(), &t, "CTA:");
    let t = replace_all(trailing_undefined_re(), &t, "");
    t.trim_end().to_string()
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn addresses_viewer(text: &str) -> bool {
    matches(you_re(), text)
}

pub fn is_generic_question(text: &str) -> bool {
    matches(generic_q_re(), text)
}

pub fn has_action_verb(text: &str) -> bool {
    matches(action_verbs_re(), text)
}

fn strip_md_noise(text: &str) -> String {
    replace_all(md_noise_re(), text, "").trim().to_string()
}

fn ensure_end_punct(text: &str) -> String {
    if text.is_empty() || text.ends_with(['.', '!', '?', '…']) {
        text.to_string()
    } else {
        format!("{text}.")
    }
}

fn first_sentence_or_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    match first_sentence_re().ok().and_then(|re| re.captures(line)) {
        Some(caps) => caps[1].trim().to_string(),
        None => line.to_string(),
    }
}

/// Keeps the first `max_words` words and marks the cut with an ellipsis.
pub fn cap_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        return text.to_string();
    }
    let kept = words[..max_words].join(" ");
    format!("{}…", kept.trim_end_matches([',', ';', ':', '–', '-']))
}

fn extract_after_label(text: &str, label: Result<&Regex>) -> String {
    let t = text.trim();
    let extracted = match label.ok().and_then(|re| re.captures(t)) {
        Some(caps) => caps[1].trim().to_string(),
        None => t.to_string(),
    };
    replace_all(trailing_undefined_re(), &extracted, "").trim().to_string()
}

pub fn tighten_hook(raw: &str) -> String {
    let t = extract_after_label(raw, after_hook_re());
    let t = strip_md_noise(&t);
    let t = first_sentence_or_line(&t);
    let t = cap_words(&t, HOOK_MAX_WORDS);
    ensure_end_punct(&t)
}

pub fn hook_needs_reforge(hook: &str) -> bool {
    if hook.is_empty() {
        return true;
    }
    let words = word_count(hook);
    words < 8 || words > 18 || !addresses_viewer(hook) || is_generic_question(hook)
}

pub fn tighten_body(raw: &str) -> String {
    let t = extract_after_label(raw, after_body_re());
    let t = strip_md_noise(&t);
    let t = replace_all(bullet_re(), &t, "");
    let t = replace_all(whitespace_re(), &t, " ");
    let t = cap_words(t.trim(), BODY_MAX_WORDS);
    ensure_end_punct(&t)
}

pub fn body_needs_reforge(body: &str) -> bool {
    if body.is_empty() {
        return true;
    }
    let words = word_count(body);
    words < 50
        || words > 100
        || !addresses_viewer(body)
        || is_generic_question(body)
        || !has_action_verb(body)
}

pub fn tighten_cta(raw: &str) -> String {
    let t = extract_after_label(raw, after_cta_re());
    let t = strip_md_noise(&t);
    let t = first_sentence_or_line(&t);
    let t = cap_words(&t, CTA_MAX_WORDS);
    ensure_end_punct(&t)
}

pub fn cta_needs_reforge(cta: &str) -> bool {
    if cta.is_empty() {
        return true;
    }
    word_count(cta) > 24 || !has_action_verb(cta) || !addresses_viewer(cta)
}

/// Joins accepted sections into the script layout clients expect.
pub fn join_sections(hook: &str, body: &str, cta: &str) -> String {
    normalize_sections(format!("Hook: {hook}\n\nBody: {body}\n\nCTA: {cta}").trim())
}
