use anyhow::Result;

use super::claude::ClaudeClient;

const SYSTEM_PROMPT: &str =
    "You are a concise summarizer. Return only a short TL;DR summary, no preamble.";
const MAX_INPUT_CHARS: usize = 15_000;

pub async fn summarize_text(client: &ClaudeClient, text: &str) -> Result<String> {
    if text.trim().is_empty() {
        return Ok(String::new());
    }

    let clipped = clip(text, MAX_INPUT_CHARS);
    let result = client
        .complete(SYSTEM_PROMPT, &format!("Summarize this text:\n\n{clipped}"))
        .await?;
    Ok(result.trim().to_string())
}

pub(super) fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}
