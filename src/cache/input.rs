//! Prompt inputs as seen by the slot cache.
//!
//! An input is either a text token or a multimodal item (image, audio
//! chunk, ...) identified by a hash of its content. The cache only ever
//! compares inputs; it never looks inside a multimodal payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Token identifier produced by the tokenizer.
pub type TokenId = i32;

/// A single element of a prompt or of a slot's resident prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    /// A text token.
    Token(TokenId),

    /// A multimodal item. Two items are the same input when their content
    /// hashes match, whatever their payloads.
    Multimodal {
        /// 64-bit hash of the item's semantic content.
        hash: u64,
        /// Encoded item, owned by the embedding stage.
        #[serde(default)]
        payload: Bytes,
    },
}

impl Input {
    /// Create a token input.
    pub fn token(id: TokenId) -> Self {
        Input::Token(id)
    }

    /// Create a multimodal input from its content hash and payload.
    pub fn multimodal(hash: u64, payload: impl Into<Bytes>) -> Self {
        Input::Multimodal {
            hash,
            payload: payload.into(),
        }
    }

    pub fn is_token(&self) -> bool {
        matches!(self, Input::Token(_))
    }

    pub fn is_multimodal(&self) -> bool {
        matches!(self, Input::Multimodal { .. })
    }
}

impl PartialEq for Input {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Input::Token(a), Input::Token(b)) => a == b,
            (Input::Multimodal { hash: a, .. }, Input::Multimodal { hash: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for Input {}

impl From<TokenId> for Input {
    fn from(id: TokenId) -> Self {
        Input::Token(id)
    }
}
