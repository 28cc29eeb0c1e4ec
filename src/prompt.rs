use serde_json::Value;

pub const SYSTEM_PROMPT: &str = "You are a professional Instagram Reels scriptwriter. \
Write emotionally engaging, high-retention scripts optimized for 30–60 seconds. \
You MUST return ONLY the three labeled sections, exactly in this order, with a blank line between each:\n\n\
Hook: ...\n\n\
Body: ...\n\n\
CTA: ...\n\n\
Rules:\n\
- Voice: spoken, natural English with contractions and plain words. No corporate or robotic phrasing.\n\
- Ban AI-scented words: embark, realm, transcend, unveil, discourse, insight, leverage (as a noun), \
unlock your potential, embrace, journey, harness, thus, hereby.\n\
- Hook: ONE sentence, bold/specific/curiosity-driving. No generic questions like \"Are you a content creator...?\". \
Prefer claims, numbers, or pattern breaks; speak to one viewer using 'you/your'.\n\
- Body: short sentences (spoken cadence). Show one emotional shift (e.g., overwhelm to control). \
Provide a tiny framework, example, or 2–3 concrete steps with benefit-first phrasing; talk to ONE viewer ('you/your').\n\
- Tight match to niche, follower level, tone, and topic.\n\
- Format: no extra sections, no preamble/postscript, no hashtags, no emoji spam, no markdown formatting.\n\
- Length: ~80–110 words TOTAL across Hook+Body+CTA (do not exceed 110).\n\
- CTA: 1–2 lines, imperative and highly clickable, tied to the content, speaking to ONE viewer ('you/your').\n\
- If you produce anything outside the exact Hook/Body/CTA structure, FIX IT and produce only the three sections.\n";

pub const HOOK_SYSTEM_PROMPT: &str = "You are a professional IG Reels HOOK specialist.\n\
Return ONLY one sentence labeled exactly 'Hook:' (8–16 words).\n\
Absolute rules:\n\
- Speak directly to ONE viewer using second person ('you/your').\n\
- Name a concrete pain, desire, or moment in the first 3–5 words.\n\
- Use present tense and everyday words; sound human and conversational.\n\
- Create a curiosity gap or pattern break (micro-contrast or counterintuitive angle).\n\
- NO generic question templates (e.g., 'Ever wonder...', 'Are you...', 'Have you ever...', 'Did you know...').\n\
- NO bullets, NO markdown, NO bold, NO emojis, NO quotes, NO hashtags, NO extra text.\n\
Format example (style, not content):\n\
Hook: You open Instagram and your ideas vanish, so try this 10-second prompt.\n";

pub const BODY_SYSTEM_PROMPT: &str = "You are a professional IG Reels BODY writer. \
Return ONLY the Body labeled exactly 'Body:' in around 60–90 words. \
Talk directly to ONE viewer using 'you/your'. Start with empathy (pain/desire), then give a micro-story \
or vivid moment, then 2–3 concrete, easy steps (benefit-first phrasing). Use spoken cadence and contractions. \
Do NOT restate the Hook. No extra sections.";

pub const CTA_SYSTEM_PROMPT: &str = "You are a professional IG Reels CTA copywriter. \
Return ONLY the CTA labeled exactly 'CTA:' in 1–2 short lines. \
Use an imperative verb directed at ONE viewer ('you/your'), tie it to the Body's promise, \
and keep it frictionless (e.g., 'Save this', 'Comment \"me\"', 'Follow for X'). No extra sections.";

pub const REFORGE_HOOK_SYSTEM_PROMPT: &str = "You rewrite hooks to be direct, human, and relatable.\n\
Return ONLY one sentence labeled exactly 'Hook:' (8–16 words) addressing ONE viewer using 'you/your'.\n\
Name a concrete pain/desire early; avoid generic questions; no markdown/quotes/emojis.\n";

pub const REFORGE_BODY_SYSTEM_PROMPT: &str = "You rewrite the BODY of an IG Reel to be persuasive and human.\n\
Return ONLY 'Body:' followed by ~60–90 words addressing ONE viewer using 'you/your'.\n\
Start with empathy (pain/desire), include a vivid mini-moment or micro-story, \
then give 2–3 concrete steps or a tiny framework with benefit-first phrasing. \
Use short spoken sentences and contractions. Avoid generic openers and buzzwords. No extra sections.";

pub const REFORGE_CTA_SYSTEM_PROMPT: &str = "You rewrite CTAs to be clear, human, and high-converting.\n\
Return ONLY 'CTA:' followed by 1 short line (max ~16 words) speaking to ONE viewer using 'you/your'.\n\
Start with an imperative verb aligned to the Body (e.g., Save, Comment 'me', Follow, DM, Share). \
Keep it frictionless and specific. No emojis, no hashtags, no extra sections.";

const STYLE_GUIDANCE: &str = " Make it sound like spoken language, not an essay. \
Include one emotional shift and at least one concrete example or 2–3 steps \
relevant to my audience level. Keep total length ~80–110 words.";

const MAX_TOPIC_WORDS: usize = 30;

/// The content brief a creator submits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Brief {
    pub niche: String,
    pub sub_category: String,
    pub follower_count: String,
    pub tone: String,
    pub more_specific: String,
}

impl Brief {
    /// Reads the brief out of a request body, normalizing every field.
    pub fn from_json(body: &Value) -> Self {
        let niche = match body.get("niche") {
            Some(v) => field_text(v),
            None => "Instagram".to_string(),
        };
        Self {
            niche,
            sub_category: text_at(body, "subCategory"),
            follower_count: text_at(body, "followerCount"),
            tone: text_at(body, "tone"),
            more_specific: limit_words(&text_at(body, "moreSpecific"), MAX_TOPIC_WORDS),
        }
    }

    pub fn user_prompt(&self) -> String {
        let opening = if self.niche.is_empty() {
            "I'm creating Reels".to_string()
        } else {
            format!("I'm creating Reels in the '{}' niche", self.niche)
        };

        let mut parts = vec![opening];
        if !self.sub_category.is_empty() {
            parts.push(format!("focused on '{}'", self.sub_category));
        }
        if !self.follower_count.is_empty() {
            parts.push(format!("with a follower level of '{}'", self.follower_count));
        }
        if !self.tone.is_empty() {
            parts.push(format!("in a '{}' tone", self.tone));
        }

        let mut prompt = parts.join(", ");
        prompt.push('.');
        if !self.more_specific.is_empty() {
            prompt.push_str(&format!(
                " The script should revolve around: '{}'.",
                self.more_specific
            ));
        }
        prompt.push_str(STYLE_GUIDANCE);
        prompt
    }
}

/// Looks up `key` and normalizes it; missing keys read as empty.
pub fn text_at(body: &Value, key: &str) -> String {
    body.get(key).map(field_text).unwrap_or_default()
}

/// Flattens a JSON scalar to single-line text. Null and false read as empty.
pub fn field_text(value: &Value) -> String {
    let raw = match value {
        Value::Null | Value::Bool(false) => return String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    raw.replace(['\n', '\r'], " ").trim().to_string()
}

fn limit_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        text.to_string()
    } else {
        words[..max_words].join(" ")
    }
}
