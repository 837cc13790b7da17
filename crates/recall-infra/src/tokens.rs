//! BPE token counting with `tiktoken-rs`.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;
use tracing::warn;

use recall_core::conversation::tokens::{HeuristicTokenCounter, TokenCounter};
use recall_types::error::TokenCountError;

/// Exact token counts under the `cl100k_base` encoding.
pub struct TiktokenCounter {
    bpe: CoreBPE,
}

impl TiktokenCounter {
    pub fn cl100k() -> Result<Self, TokenCountError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| TokenCountError(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for TiktokenCounter {
    fn name(&self) -> &str {
        "cl100k_base"
    }

    fn count(&self, text: &str) -> Result<usize, TokenCountError> {
        Ok(self.bpe.encode_with_special_tokens(text).len())
    }
}

/// The precise counter when its vocabulary loads, the heuristic otherwise.
pub fn default_token_counter() -> Arc<dyn TokenCounter> {
    match TiktokenCounter::cl100k() {
        Ok(counter) => Arc::new(counter),
        Err(e) => {
            warn!(error = %e, "BPE tokenizer unavailable, using character heuristic");
            Arc::new(HeuristicTokenCounter)
        }
    }
}
