//! Named values shared between the tasks of a flow run.
//!
//! The [`Context`] is the single mutable store of a run. Tasks never write to
//! it directly: a task receives a read-only view together with its declared
//! [`Inputs`], returns its [`Outputs`], and may leave side observations in a
//! [`Journal`]. The engine merges both back into the context after the task
//! succeeds.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use serde_json::Value;

use crate::error::TaskResult;

fn decode<T: DeserializeOwned>(name: &str, value: &Value) -> TaskResult<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| anyhow::anyhow!("Value '{name}' has unexpected shape: {e}"))
}

/// Mapping from name to value, threaded through a whole flow run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Deserializes the value stored under `name`, returns `None` when absent.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> TaskResult<Option<T>> {
        self.values
            .get(name)
            .map(|value| decode(name, value))
            .transpose()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merges task outputs into the context.
    /// Entries from `outputs` overwrite existing entries with the same name.
    pub fn merge(&mut self, outputs: &Outputs) {
        for (name, value) in &outputs.values {
            self.values.insert(name.clone(), value.clone());
        }
    }

    /// Collects the values a task asked for. Names missing from the context
    /// are skipped, the task decides whether that is an error.
    pub(crate) fn select<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Inputs {
        let values = names
            .into_iter()
            .filter_map(|name| Some((name.clone(), self.values.get(name)?.clone())))
            .collect();

        Inputs { values }
    }

    pub(crate) fn apply_journal(&mut self, journal: Journal) {
        for entry in journal.entries {
            match entry {
                Entry::Record(name, value) => {
                    self.values.insert(name, value);
                }
                Entry::Append(name, value) => {
                    let slot = self.values.entry(name).or_insert(Value::Array(vec![]));
                    match slot {
                        Value::Array(items) => items.push(value),
                        other => {
                            let prev = other.take();
                            *other = Value::Array(vec![prev, value]);
                        }
                    }
                }
            }
        }
    }

    /// Serialize the context to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<serde_json::Map<String, Value>> for Context {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self {
            values: map.into_iter().collect(),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Context
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// The values a task declared it requires, extracted from the context right
/// before `apply` is called.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    values: BTreeMap<String, Value>,
}

impl Inputs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Like [`Inputs::get`], but a missing value is an error.
    pub fn require(&self, name: &str) -> TaskResult<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Input '{name}' not found"))
    }

    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> TaskResult<T> {
        decode(name, self.require(name)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The values produced by a successful `apply`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Outputs {
    values: BTreeMap<String, Value>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Outputs
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Record(String, Value),
    Append(String, Value),
}

/// Side observations left by a task during `apply`.
///
/// Entries land in the context under ordinary names once the task succeeds,
/// after its outputs were merged. They are dropped when the task fails.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Vec<Entry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to `value`.
    pub fn record(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.entries.push(Entry::Record(name.into(), value.into()));
    }

    /// Pushes `value` onto the list stored under `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.entries.push(Entry::Append(name.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
