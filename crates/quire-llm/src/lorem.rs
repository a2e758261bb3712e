use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use quire_core::{
    BlockDelta, BlockType, GenerateRequest, LlmProvider, ProviderError, ProviderEvent, ProviderStream, StopReason,
    StreamMetadata,
};

const MODEL_PREFIX: &str = "lorem-";

const WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do", "eiusmod",
    "tempor", "incididunt", "ut", "labore", "et", "dolore", "magna", "aliqua", "enim", "ad", "minim", "veniam",
    "quis", "nostrud", "exercitation", "ullamco", "laboris", "nisi", "aliquip", "ex", "ea", "commodo",
    "consequat", "duis", "aute", "irure", "in", "reprehenderit", "voluptate", "velit", "esse", "cillum",
    "fugiat", "nulla", "pariatur", "excepteur", "sint", "occaecat", "cupidatat", "non", "proident", "sunt",
    "culpa", "qui", "officia", "deserunt", "mollit", "anim", "id", "est", "laborum",
];

/// Development provider that streams lorem ipsum without any network access.
///
/// The model name picks the pacing: `slow` (500ms per word), `fast` (33ms),
/// anything else 100ms. `cutoff` and `small` models always run into the
/// token limit.
pub struct LoremProvider {
    rng: Mutex<StdRng>,
    min_words: usize,
    max_words: usize,
}

impl Default for LoremProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LoremProvider {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            min_words: 40,
            max_words: 160,
        }
    }

    /// Deterministic output, for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..Self::new()
        }
    }

    pub fn with_word_range(mut self, min_words: usize, max_words: usize) -> Self {
        self.min_words = min_words.max(1);
        self.max_words = max_words.max(self.min_words);
        self
    }

    /// Pause between words for `model`.
    pub fn word_delay(model: &str) -> Duration {
        if model.contains("slow") {
            Duration::from_millis(500)
        } else if model.contains("fast") {
            Duration::from_millis(33)
        } else {
            Duration::from_millis(100)
        }
    }

    fn is_cutoff_model(model: &str) -> bool {
        model.contains("cutoff") || model.contains("small")
    }

    fn script(&self, request: &GenerateRequest) -> Vec<ProviderEvent> {
        let mut rng = self.rng.lock();
        let limit = request.params.max_tokens.max(1) as usize;
        let mut events = Vec::new();
        let mut emitted = 0usize;
        let mut index = 0u32;

        if request.params.thinking.is_enabled() {
            let count = rng.gen_range(8..=24).min(limit);
            for (i, word) in sentence_words(&mut rng, count).into_iter().enumerate() {
                let mut delta = BlockDelta::thinking(index, if i == 0 { word } else { format!(" {word}") });
                if i == 0 {
                    delta = delta.with_block_type(BlockType::Thinking);
                }
                events.push(ProviderEvent::Delta(delta));
            }
            events.push(ProviderEvent::Delta(BlockDelta::signature(
                index,
                format!("lorem-sig-{:016x}", rng.gen::<u64>()),
            )));
            emitted += count;
            index += 1;
        }

        let wanted = if Self::is_cutoff_model(&request.model) {
            limit + 1
        } else {
            rng.gen_range(self.min_words..=self.max_words)
        };
        let budget = limit.saturating_sub(emitted);
        let count = wanted.min(budget);
        for (i, word) in sentence_words(&mut rng, count).into_iter().enumerate() {
            let mut delta = BlockDelta::text(index, if i == 0 { word } else { format!(" {word}") });
            if i == 0 {
                delta = delta.with_block_type(BlockType::Text);
            }
            events.push(ProviderEvent::Delta(delta));
        }
        emitted += count;

        let stop_reason = if wanted > budget {
            StopReason::MaxTokens
        } else {
            StopReason::EndTurn
        };
        let input_tokens: usize = request.messages.iter().map(|m| m.text().split_whitespace().count()).sum();
        events.push(ProviderEvent::Metadata(StreamMetadata {
            model: request.model.clone(),
            input_tokens: input_tokens as u32,
            output_tokens: emitted as u32,
            stop_reason,
            response_metadata: Some(serde_json::json!({ "mock": true, "provider": "lorem" })),
        }));
        events
    }
}

/// `count` words grouped into capitalized sentences.
fn sentence_words(rng: &mut StdRng, count: usize) -> Vec<String> {
    let mut words = Vec::with_capacity(count);
    let mut until_stop = rng.gen_range(6..=14);
    let mut capitalize = true;
    for i in 0..count {
        let mut word = WORDS[rng.gen_range(0..WORDS.len())].to_string();
        if capitalize {
            word[..1].make_ascii_uppercase();
            capitalize = false;
        }
        until_stop -= 1;
        if until_stop == 0 || i + 1 == count {
            word.push('.');
            capitalize = true;
            until_stop = rng.gen_range(6..=14);
        }
        words.push(word);
    }
    words
}

#[async_trait]
impl LlmProvider for LoremProvider {
    fn name(&self) -> &str {
        "lorem"
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with(MODEL_PREFIX)
    }

    async fn stream_response(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        if !self.supports_model(&request.model) {
            return Err(ProviderError::UnsupportedModel {
                provider: self.name().to_string(),
                model: request.model,
            });
        }
        let delay = Self::word_delay(&request.model);
        let events = VecDeque::from(self.script(&request));
        debug!(model = %request.model, events = events.len(), "lorem stream scripted");

        let paced = stream::unfold(events, move |mut pending| {
            let cancel = cancel.clone();
            async move {
                let next = pending.pop_front()?;
                if matches!(next, ProviderEvent::Delta(_)) {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else if cancel.is_cancelled() {
                    return None;
                }
                Some((next, pending))
            }
        });
        Ok(Box::pin(paced))
    }
}
