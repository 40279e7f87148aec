use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::blocks::claude::ClaudeClient;
use crate::blocks::{classify, extract_emails, fetch_url, rewrite, summarize, translate};
use crate::entitlements::EntitlementStore;
use crate::registry::BlockDefinition;
use crate::tokens::TokenLedger;
use crate::types::ScalarValue;

pub type BlockInputs = HashMap<String, String>;
pub type BlockOutputs = HashMap<String, ScalarValue>;

#[derive(Debug, Error)]
pub enum BlockRunError {
    #[error("block is locked; purchase or subscribe to unlock it")]
    Locked {
        feature_slug: String,
        price_slug: String,
    },

    #[error("insufficient tokens: need {token_cost}, have {current_balance}")]
    InsufficientBalance {
        token_cost: u32,
        current_balance: u32,
    },

    #[error("{0}")]
    Execution(String),
}

/// Executes one block given resolved inputs.
#[async_trait]
pub trait BlockRunner: Send + Sync {
    async fn run_block(
        &self,
        block: &BlockDefinition,
        inputs: &BlockInputs,
    ) -> Result<BlockOutputs, BlockRunError>;
}

fn input<'a>(inputs: &'a BlockInputs, key: &str) -> &'a str {
    inputs.get(key).map(String::as_str).unwrap_or("")
}

/// Runs catalog blocks in-process: utility blocks directly, AI blocks via
/// the Claude client.
pub struct LocalBlockRunner {
    claude: ClaudeClient,
    http: reqwest::Client,
}

impl LocalBlockRunner {
    pub fn new(claude: ClaudeClient) -> Self {
        Self {
            claude,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BlockRunner for LocalBlockRunner {
    async fn run_block(
        &self,
        block: &BlockDefinition,
        inputs: &BlockInputs,
    ) -> Result<BlockOutputs, BlockRunError> {
        let execution = |err: anyhow::Error| BlockRunError::Execution(format!("{err:#}"));

        match block.id.as_str() {
            "trigger" => Ok(HashMap::from([(
                String::from("trigger"),
                ScalarValue::Bool(true),
            )])),
            "constant" => {
                let value = input(inputs, "value");
                Ok(HashMap::from([(
                    String::from("value"),
                    ScalarValue::from(value),
                )]))
            }
            "text-join" => {
                let text1 = input(inputs, "text1").trim();
                let text2 = input(inputs, "text2").trim();
                let separator = match input(inputs, "separator").trim() {
                    "" => " ",
                    other => other,
                };
                let combined = [text1, text2]
                    .iter()
                    .filter(|part| !part.is_empty())
                    .copied()
                    .collect::<Vec<_>>()
                    .join(separator);
                Ok(HashMap::from([(
                    String::from("combined"),
                    ScalarValue::from(combined),
                )]))
            }
            "conditional" => {
                let text = input(inputs, "text").trim();
                let pattern = input(inputs, "pattern").trim();
                let matched = if pattern.is_empty() {
                    !text.is_empty()
                } else {
                    text.contains(pattern)
                };
                Ok(HashMap::from([(
                    String::from("match"),
                    ScalarValue::Bool(matched),
                )]))
            }
            "fetch-url" => {
                let page = fetch_url::fetch_url(&self.http, input(inputs, "url"))
                    .await
                    .map_err(execution)?;
                Ok(HashMap::from([
                    (String::from("body"), ScalarValue::from(page.body)),
                    (
                        String::from("status_code"),
                        ScalarValue::Number(f64::from(page.status_code)),
                    ),
                ]))
            }
            "summarize-text" => {
                let summary = summarize::summarize_text(&self.claude, input(inputs, "text"))
                    .await
                    .map_err(execution)?;
                Ok(HashMap::from([(
                    String::from("summary"),
                    ScalarValue::from(summary),
                )]))
            }
            "extract-emails" => {
                let emails = extract_emails::extract_emails(&self.claude, input(inputs, "text"))
                    .await
                    .map_err(execution)?;
                Ok(HashMap::from([(
                    String::from("emails"),
                    ScalarValue::from(emails.join(", ")),
                )]))
            }
            "rewrite-prompt" => {
                let rewritten = rewrite::rewrite_prompt(&self.claude, input(inputs, "text"))
                    .await
                    .map_err(execution)?;
                Ok(HashMap::from([(
                    String::from("rewritten"),
                    ScalarValue::from(rewritten),
                )]))
            }
            "classify-input" => {
                let classification = classify::classify_input(&self.claude, input(inputs, "text"))
                    .await
                    .map_err(execution)?;
                Ok(HashMap::from([
                    (
                        String::from("label"),
                        ScalarValue::from(classification.label),
                    ),
                    (
                        String::from("confidence"),
                        ScalarValue::Number(classification.confidence),
                    ),
                ]))
            }
            "translate-text" => {
                let translated = translate::translate_text(
                    &self.claude,
                    input(inputs, "text"),
                    input(inputs, "target_language"),
                )
                .await
                .map_err(execution)?;
                Ok(HashMap::from([(
                    String::from("translated"),
                    ScalarValue::from(translated),
                )]))
            }
            other => Err(BlockRunError::Execution(format!(
                "unimplemented block: {other}"
            ))),
        }
    }
}

/// Entitlement and token gate in front of a runner; the path every HTTP
/// caller goes through. Entitlement checks are skipped in demo mode, token
/// costs are charged regardless.
pub struct GatedBlockRunner<'a> {
    inner: &'a dyn BlockRunner,
    ledger: &'a TokenLedger,
    entitlements: &'a EntitlementStore,
    user_id: String,
    demo_mode: bool,
}

impl<'a> GatedBlockRunner<'a> {
    pub fn new(
        inner: &'a dyn BlockRunner,
        ledger: &'a TokenLedger,
        entitlements: &'a EntitlementStore,
        user_id: impl Into<String>,
        demo_mode: bool,
    ) -> Self {
        Self {
            inner,
            ledger,
            entitlements,
            user_id: user_id.into(),
            demo_mode,
        }
    }
}

#[async_trait]
impl BlockRunner for GatedBlockRunner<'_> {
    async fn run_block(
        &self,
        block: &BlockDefinition,
        inputs: &BlockInputs,
    ) -> Result<BlockOutputs, BlockRunError> {
        if !self.demo_mode && !self.entitlements.has_access(&self.user_id, &block.feature_slug) {
            return Err(BlockRunError::Locked {
                feature_slug: block.feature_slug.clone(),
                price_slug: block.price_slug.clone(),
            });
        }

        if block.token_cost > 0 {
            self.ledger
                .deduct(&self.user_id, block.token_cost)
                .map_err(|err| BlockRunError::InsufficientBalance {
                    token_cost: err.needed,
                    current_balance: err.available,
                })?;
        }

        match self.inner.run_block(block, inputs).await {
            Ok(outputs) => Ok(outputs),
            Err(err) => {
                // Refund the charge when the block itself failed.
                if block.token_cost > 0 {
                    self.ledger
                        .credit(&self.user_id, block.token_cost, "run failed");
                }
                Err(err)
            }
        }
    }
}
