//! Token estimation for artifact manifests.
//!
//! Uses the cl100k_base encoding, which tracks the assistant's tokenizer
//! closely enough for manifest estimates.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tiktoken_rs::{cl100k_base, CoreBPE};

const CACHE_CAPACITY: usize = 4096;

lazy_static! {
    /// Encoder is expensive to build; `None` if it failed to load
    static ref BPE: Option<CoreBPE> = match cl100k_base() {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            tracing::warn!(error = %e, "cl100k_base unavailable, using quick estimates");
            None
        }
    };
}

/// Token counts keyed by content hash
static TOKEN_CACHE: RwLock<Option<HashMap<u64, u32>>> = RwLock::new(None);

fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

fn cached(hash: u64) -> Option<u32> {
    TOKEN_CACHE.read().as_ref().and_then(|c| c.get(&hash).copied())
}

fn remember(hash: u64, count: u32) {
    let mut guard = TOKEN_CACHE.write();
    let cache = guard.get_or_insert_with(|| HashMap::with_capacity(CACHE_CAPACITY));
    // At capacity: drop half rather than tracking recency
    if cache.len() >= CACHE_CAPACITY {
        let evict: Vec<u64> = cache.keys().take(CACHE_CAPACITY / 2).copied().collect();
        for key in evict {
            cache.remove(&key);
        }
    }
    cache.insert(hash, count);
}

/// Count tokens in `text`, cached by content hash
pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let hash = hash_content(text);
    if let Some(count) = cached(hash) {
        return count;
    }

    let count = match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => estimate_tokens_quick(text),
    };
    remember(hash, count);
    count
}

/// ~4 bytes per token
pub fn estimate_tokens_quick(text: &str) -> u32 {
    (text.len() as f64 / 4.0).ceil() as u32
}
