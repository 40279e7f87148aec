use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;

use super::claude::ClaudeClient;
use super::summarize::clip;

const SYSTEM_PROMPT: &str = "You extract email addresses from text. Reply with only a \
comma-separated list of emails found, or \"none\" if none.";
const MAX_INPUT_CHARS: usize = 8_000;

fn email_regex() -> &'static Regex {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    EMAIL_RE.get_or_init(|| {
        Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}")
            .expect("email regex should compile")
    })
}

/// Regex fast-path first; the model is only consulted when the pattern
/// finds nothing. Results are deduplicated preserving first occurrence.
pub async fn extract_emails(client: &ClaudeClient, text: &str) -> Result<Vec<String>> {
    let matches: Vec<String> = email_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    if !matches.is_empty() {
        return Ok(dedup(matches));
    }

    let reply = client
        .complete(SYSTEM_PROMPT, clip(text, MAX_INPUT_CHARS))
        .await?;
    if reply.to_lowercase().contains("none") {
        return Ok(Vec::new());
    }

    let from_llm: Vec<String> = reply
        .split([' ', '\n', '\t', ','])
        .filter(|part| part.contains('@'))
        .map(|part| part.to_string())
        .collect();
    Ok(dedup(from_llm))
}

fn dedup(emails: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    emails
        .into_iter()
        .filter(|email| seen.insert(email.clone()))
        .collect()
}
