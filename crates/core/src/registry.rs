use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Feature slug shared by the free utility blocks; never gated.
pub const FREE_FEATURE_SLUG: &str = "free";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    pub key: String,
    pub label: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
    pub key: String,
    pub label: String,
}

/// Immutable catalog entry describing one block: identity, billing slugs,
/// and the declared input/output schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub feature_slug: String,
    pub price_slug: String,
    pub uses_ai: bool,
    pub token_cost: u32,
    pub inputs: Vec<InputDefinition>,
    pub outputs: Vec<OutputDefinition>,
}

impl BlockDefinition {
    pub fn is_free(&self) -> bool {
        self.feature_slug == FREE_FEATURE_SLUG
    }

    pub fn input(&self, key: &str) -> Option<&InputDefinition> {
        self.inputs.iter().find(|input| input.key == key)
    }

    pub fn output(&self, key: &str) -> Option<&OutputDefinition> {
        self.outputs.iter().find(|output| output.key == key)
    }
}

pub struct BlockRegistry {
    definitions: HashMap<String, BlockDefinition>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    pub fn register(&mut self, definition: BlockDefinition) {
        self.definitions.insert(definition.id.clone(), definition);
    }

    pub fn get(&self, block_type: &str) -> Option<&BlockDefinition> {
        self.definitions.get(block_type)
    }

    pub fn list_block_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.definitions.keys().map(|id| id.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Catalog entries in id order, the shape served by `GET /api/blocks`.
    pub fn all(&self) -> Vec<&BlockDefinition> {
        let mut definitions: Vec<&BlockDefinition> = self.definitions.values().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn input(key: &str, label: &str, required: bool) -> InputDefinition {
    InputDefinition {
        key: key.to_string(),
        label: label.to_string(),
        required,
    }
}

fn output(key: &str, label: &str) -> OutputDefinition {
    OutputDefinition {
        key: key.to_string(),
        label: label.to_string(),
    }
}

fn ai_block(
    id: &str,
    name: &str,
    description: &str,
    inputs: Vec<InputDefinition>,
    outputs: Vec<OutputDefinition>,
) -> BlockDefinition {
    let slug = id.replace('-', "_");
    BlockDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        feature_slug: slug.clone(),
        price_slug: slug,
        uses_ai: true,
        token_cost: 1,
        inputs,
        outputs,
    }
}

fn free_block(
    id: &str,
    name: &str,
    description: &str,
    inputs: Vec<InputDefinition>,
    outputs: Vec<OutputDefinition>,
) -> BlockDefinition {
    BlockDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        feature_slug: FREE_FEATURE_SLUG.to_string(),
        price_slug: FREE_FEATURE_SLUG.to_string(),
        uses_ai: false,
        token_cost: 0,
        inputs,
        outputs,
    }
}

/// Register the built-in block catalog.
///
/// The ids match the block ids used by workflow documents so that exported
/// flows round-trip cleanly between clients and the backend.
pub fn register_builtin_blocks(registry: &mut BlockRegistry) {
    registry.register(free_block(
        "trigger",
        "Trigger",
        "Start of a workflow. No inputs; outputs a signal so other blocks can depend on it.",
        vec![],
        vec![output("trigger", "Signal")],
    ));
    registry.register(free_block(
        "constant",
        "Constant",
        "Output a fixed value you type in.",
        vec![input("value", "Value", true)],
        vec![output("value", "Value")],
    ));
    registry.register(free_block(
        "text-join",
        "Text Join",
        "Combine two text inputs into one, with an optional separator.",
        vec![
            input("text1", "First text", true),
            input("text2", "Second text", true),
            input("separator", "Separator (e.g. space)", false),
        ],
        vec![output("combined", "Combined text")],
    ));
    registry.register(free_block(
        "conditional",
        "Conditional",
        "Check if text is non-empty or contains a pattern. Outputs true/false.",
        vec![
            input("text", "Text to check", true),
            input("pattern", "Contains (optional)", false),
        ],
        vec![output("match", "Match result")],
    ));
    registry.register(free_block(
        "fetch-url",
        "Fetch URL",
        "Enter a URL and get the page content as text.",
        vec![input("url", "URL to fetch", true)],
        vec![
            output("body", "Page content"),
            output("status_code", "HTTP status code"),
        ],
    ));
    registry.register(ai_block(
        "summarize-text",
        "Summarize Text",
        "TL;DR summary of a pasted document.",
        vec![input("text", "Text to summarize", true)],
        vec![output("summary", "Summary")],
    ));
    registry.register(ai_block(
        "extract-emails",
        "Extract Emails",
        "Extract all email addresses from raw text.",
        vec![input("text", "Text to scan", true)],
        vec![output("emails", "Extracted emails")],
    ));
    registry.register(ai_block(
        "rewrite-prompt",
        "Rewrite Prompt",
        "Reframe input text for clarity and structure.",
        vec![input("text", "Input to rewrite", true)],
        vec![output("rewritten", "Rewritten text")],
    ));
    registry.register(ai_block(
        "classify-input",
        "Classify Input",
        "Label text as positive, neutral, or negative.",
        vec![input("text", "Text to classify", true)],
        vec![
            output("label", "Sentiment"),
            output("confidence", "Confidence"),
        ],
    ));
    registry.register(ai_block(
        "translate-text",
        "Translate Text",
        "Translate text into a target language.",
        vec![
            input("text", "Text to translate", true),
            input("target_language", "Target language (e.g. Spanish, French)", true),
        ],
        vec![output("translated", "Translated text")],
    ));
}

pub fn build_default_registry() -> BlockRegistry {
    let mut registry = BlockRegistry::new();
    register_builtin_blocks(&mut registry);
    registry
}
