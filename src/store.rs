use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error as ThisError;

/// In-memory key/value backend for the example server. Thread-safe and
/// cheaply cloneable; every connection task shares the same state through
/// reference counting.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<HashMap<String, Bytes>>>,
}

#[derive(Debug, ThisError, PartialEq)]
pub enum StoreError {
    #[error("value is not an integer or out of range")]
    NotAnInteger,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: String, value: Bytes) {
        self.inner.lock().unwrap().insert(key, value);
    }

    /// Removes `key`, reporting whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().unwrap().remove(key).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.inner.lock().unwrap().contains_key(key)
    }

    /// Appends to the value, creating the key when absent. Returns the new
    /// length.
    pub fn append(&self, key: &str, suffix: &[u8]) -> usize {
        let mut state = self.inner.lock().unwrap();
        let mut value = state.get(key).map(|v| v.to_vec()).unwrap_or_default();
        value.extend_from_slice(suffix);
        let length = value.len();
        state.insert(key.to_string(), Bytes::from(value));
        length
    }

    /// Adds `delta` to the integer stored at `key`, treating a missing key
    /// as 0. Fails when the current value is not a base-10 integer.
    pub fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut state = self.inner.lock().unwrap();
        let current = match state.get(key) {
            None => 0,
            Some(value) => std::str::from_utf8(value)
                .map_err(|_| StoreError::NotAnInteger)?
                .parse::<i64>()
                .map_err(|_| StoreError::NotAnInteger)?,
        };
        let next = current.checked_add(delta).ok_or(StoreError::NotAnInteger)?;
        state.insert(key.to_string(), Bytes::from(next.to_string()));
        Ok(next)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}
