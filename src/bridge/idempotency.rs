//! Bounded LRU of results keyed by idempotency key

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;

pub struct IdempotencyCache {
    capacity: usize,
    inner: Mutex<LruInner>,
}

#[derive(Default)]
struct LruInner {
    entries: HashMap<String, JsonValue>,
    // Front is least recently used
    order: VecDeque<String>,
}

impl LruInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }
}

impl IdempotencyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LruInner::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let mut inner = self.inner.lock();
        let value = inner.entries.get(key).cloned()?;
        inner.touch(key);
        Some(value)
    }

    pub fn put(&self, key: &str, value: JsonValue) {
        let mut inner = self.inner.lock();
        if inner.entries.insert(key.to_string(), value).is_some() {
            inner.touch(key);
        } else {
            inner.order.push_back(key.to_string());
        }
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
