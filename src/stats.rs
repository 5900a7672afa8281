use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

/// Observations recorded while a check runs, such as step timings.
#[derive(Debug, Default)]
pub struct Observations {
    obs: Mutex<BTreeMap<String, Value>>,
}

impl Observations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation. A repeated key is stored under `key#n`.
    pub fn record(&self, key: &str, value: impl Into<Value>) {
        let mut obs = self.obs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut slot = key.to_string();
        let mut n = 1;
        while obs.contains_key(&slot) {
            n += 1;
            slot = format!("{}#{}", key, n);
        }
        obs.insert(slot, value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let obs = self.obs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        obs.get(key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        let obs = self.obs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        obs.is_empty()
    }

    /// All observations as one JSON object.
    pub fn to_json(&self) -> Value {
        let obs = self.obs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Value::Object(obs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}
