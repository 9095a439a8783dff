use thiserror::Error;

use crate::TokenId;

#[derive(Error, Debug)]
#[error("tokenizer error: {0}")]
pub struct TokenizerError(pub String);

/// Boundary to the external tokenization stack. The engine only needs
/// prompt encoding, output decoding, and the model's EOS id; template
/// rendering and vocabulary management stay on the other side.
pub trait Tokenizer: Send {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError>;
    fn decode(&self, token_ids: &[TokenId]) -> Result<String, TokenizerError>;
    fn eos_token_id(&self) -> TokenId;
}
