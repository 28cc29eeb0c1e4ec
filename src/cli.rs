use anyhow::{Context, Result, bail};
use creatorflow::api::openrouter::{ModelPair, OpenRouterClient};
use creatorflow::config::Config;
use creatorflow::generator::generate_script;
use creatorflow::prompt::Brief;
use serde_json::{Map, Value};

const BRIEF_KEYS: &[&str] = &["niche", "subCategory", "followerCount", "tone", "moreSpecific"];

fn usage() -> String {
    format!(
        "usage: creatorflow-cli [--premium] key=value...\n  keys: {}",
        BRIEF_KEYS.join(", ")
    )
}

/// Reads `--premium` and `key=value` pairs into a brief payload.
fn parse_args(args: impl IntoIterator<Item = String>) -> Result<(Value, bool)> {
    let mut premium = false;
    let mut fields = Map::new();
    for arg in args {
        if arg == "--premium" {
            premium = true;
            continue;
        }
        if arg == "--help" || arg == "-h" {
            bail!(usage());
        }
        let Some((key, value)) = arg.split_once('=') else {
            bail!("expected key=value, got {arg:?}\n{}", usage());
        };
        if !BRIEF_KEYS.contains(&key) {
            bail!("unknown key {key:?}\n{}", usage());
        }
        fields.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok((Value::Object(fields), premium))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    creatorflow::init_tracing();

    let (payload, premium) = parse_args(std::env::args().skip(1))?;
    let config = Config::from_env().context("invalid configuration")?;
    let models = ModelPair::from_config(&config.llm);
    let client = OpenRouterClient::new(config.llm).context("OpenRouter client")?;

    let brief = Brief::from_json(&payload);
    match generate_script(&client, &models, &brief, premium).await {
        Ok(script) => {
            println!("{}\n", script.text);
            println!("{}", serde_json::to_string_pretty(&script.meta)?);
            Ok(())
        }
        Err(failure) => {
            eprintln!("[ERROR] Upstream model failed");
            eprintln!("{}", serde_json::to_string_pretty(&failure.to_json(config.debug))?);
            std::process::exit(1);
        }
    }
}
