//! Block implementations. AI blocks are thin wrappers over the Claude API
//! and fall back to a deterministic mock reply when no key is configured.

pub mod claude;
pub mod classify;
pub mod extract_emails;
pub mod fetch_url;
pub mod rewrite;
pub mod summarize;
pub mod translate;
