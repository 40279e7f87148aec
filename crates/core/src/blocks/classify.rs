use anyhow::Result;

use super::claude::ClaudeClient;
use super::summarize::clip;

const SYSTEM_PROMPT: &str = "You classify the sentiment of the text. Reply with exactly one \
line: LABEL CONFIDENCE (e.g. positive 0.95). LABEL must be one of: positive, neutral, \
negative. CONFIDENCE is a number 0-1.";
const MAX_INPUT_CHARS: usize = 4_000;
const LABELS: [&str; 3] = ["positive", "neutral", "negative"];

pub struct Classification {
    pub label: String,
    pub confidence: f64,
}

pub async fn classify_input(client: &ClaudeClient, text: &str) -> Result<Classification> {
    if text.trim().is_empty() {
        return Ok(Classification {
            label: "neutral".to_string(),
            confidence: 0.0,
        });
    }

    let reply = client
        .complete(SYSTEM_PROMPT, clip(text, MAX_INPUT_CHARS))
        .await?;
    Ok(parse_reply(&reply))
}

fn parse_reply(reply: &str) -> Classification {
    let lowered = reply.trim().to_lowercase();
    let mut parts = lowered.split_whitespace();

    let label = match parts.next() {
        Some(word) if LABELS.contains(&word) => word.to_string(),
        _ => "neutral".to_string(),
    };
    let confidence = parts
        .next()
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    Classification { label, confidence }
}
