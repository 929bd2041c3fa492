//! Workload files replayed by `kv-slot-sim`.
//!
//! ```json
//! {
//!   "requests": [
//!     { "prompt": [1, 2, 3, {"multimodal": {"hash": 42}}], "max_tokens": 8 },
//!     { "prompt": [1, 2, 3, 9], "wave": 1, "num_keep": 2 }
//!   ]
//! }
//! ```
//!
//! Requests sharing a `wave` run concurrently; waves run in ascending order.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::input::{Input, TokenId};
use crate::config::SchedulerConfig;
use crate::scheduler::engine::GenerationRequest;

/// One prompt element: a bare token id or a full [`Input`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptItem {
    Token(TokenId),
    Input(Input),
}

impl From<PromptItem> for Input {
    fn from(item: PromptItem) -> Self {
        match item {
            PromptItem::Token(id) => Input::token(id),
            PromptItem::Input(input) => input,
        }
    }
}

fn default_max_tokens() -> usize {
    16
}

/// A request as written in the workload file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadRequest {
    /// Request ID; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    pub prompt: Vec<PromptItem>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Overrides `scheduler.num_keep`.
    #[serde(default)]
    pub num_keep: Option<usize>,

    /// Overrides `scheduler.cache_prompt`.
    #[serde(default)]
    pub cache_prompt: Option<bool>,

    #[serde(default)]
    pub wave: usize,
}

impl WorkloadRequest {
    /// Build a generation request, filling unset fields from `defaults`.
    pub fn to_generation_request(&self, defaults: &SchedulerConfig) -> GenerationRequest {
        GenerationRequest {
            request_id: self
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            prompt: self.prompt.iter().cloned().map(Input::from).collect(),
            max_tokens: self.max_tokens,
            num_keep: self.num_keep.unwrap_or(defaults.num_keep),
            cache_prompt: self.cache_prompt.unwrap_or(defaults.cache_prompt),
        }
    }
}

/// A whole workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workload {
    pub requests: Vec<WorkloadRequest>,
}

impl Workload {
    /// Load a workload from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Requests grouped by wave, in wave order. File order is kept within a wave.
    pub fn waves(&self) -> Vec<Vec<&WorkloadRequest>> {
        let mut waves: BTreeMap<usize, Vec<&WorkloadRequest>> = BTreeMap::new();
        for request in &self.requests {
            waves.entry(request.wave).or_default().push(request);
        }
        waves.into_values().collect()
    }

    /// Total prompt length across all requests.
    pub fn total_prompt_inputs(&self) -> u64 {
        self.requests.iter().map(|r| r.prompt.len() as u64).sum()
    }
}
