use anyhow::Result;

use super::claude::ClaudeClient;
use super::summarize::clip;

const SYSTEM_PROMPT: &str = "You rewrite the user's input for clarity and structure. Keep the \
same meaning; improve wording and organization. Return only the rewritten text, no preamble.";
const MAX_INPUT_CHARS: usize = 8_000;

pub async fn rewrite_prompt(client: &ClaudeClient, text: &str) -> Result<String> {
    if text.trim().is_empty() {
        return Ok(String::new());
    }

    let result = client
        .complete(SYSTEM_PROMPT, clip(text, MAX_INPUT_CHARS))
        .await?;
    Ok(result.trim().to_string())
}
