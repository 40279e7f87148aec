use anyhow::Result;

use super::claude::ClaudeClient;
use super::summarize::clip;

const MAX_INPUT_CHARS: usize = 8_000;

pub async fn translate_text(
    client: &ClaudeClient,
    text: &str,
    target_language: &str,
) -> Result<String> {
    if text.trim().is_empty() {
        return Ok(String::new());
    }

    let language = if target_language.trim().is_empty() {
        "English"
    } else {
        target_language.trim()
    };

    let system = format!(
        "You translate text into {language}. Return only the translated text, no preamble."
    );
    let result = client.complete(&system, clip(text, MAX_INPUT_CHARS)).await?;
    Ok(result.trim().to_string())
}
