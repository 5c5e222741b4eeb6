use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::store::content_hash;
use crate::types::Message;

/// Selection results stay valid for this long.
const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// Distinct fingerprints kept before the oldest is dropped.
const MAX_ENTRIES: usize = 64;
/// How much conversation tail participates in the fingerprint.
const FINGERPRINT_WINDOW: usize = 20;

/// Fingerprint over the conversation tail, the prompt, and the selection
/// options that shape the output. Feature flags are deliberately excluded:
/// config is an immutable snapshot for the engine lifetime.
pub fn fingerprint(messages: &[Message], prompt: &str, config: &EngineConfig) -> String {
    let tail_start = messages.len().saturating_sub(FINGERPRINT_WINDOW);
    let tail = serde_json::to_string(&messages[tail_start..]).unwrap_or_default();
    let key = format!(
        "{tail}|{prompt}|{}|{}|{}|{}",
        config.top_k,
        config.recent_n,
        config.min_score,
        config.model_id.as_deref().unwrap_or(""),
    );
    content_hash(&key)
}

struct Entry {
    messages: Vec<Message>,
    created: Instant,
}

/// TTL'd store of recent selection outputs keyed by fingerprint.
pub struct SelectionCache {
    entries: Mutex<(HashMap<String, Entry>, Vec<String>)>,
    ttl: Duration,
}

impl SelectionCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new((HashMap::new(), Vec::new())),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<Message>> {
        let mut guard = self.entries.lock().expect("selection cache lock");
        let (map, _) = &mut *guard;
        match map.get(key) {
            Some(entry) if entry.created.elapsed() < self.ttl => Some(entry.messages.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, messages: Vec<Message>) {
        let mut guard = self.entries.lock().expect("selection cache lock");
        let (map, order) = &mut *guard;
        if !map.contains_key(&key) {
            order.push(key.clone());
        }
        map.insert(
            key,
            Entry {
                messages,
                created: Instant::now(),
            },
        );
        while map.len() > MAX_ENTRIES && !order.is_empty() {
            let oldest = order.remove(0);
            map.remove(&oldest);
        }
    }
}

impl Default for SelectionCache {
    fn default() -> Self {
        Self::new()
    }
}
