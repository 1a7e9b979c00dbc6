//! Cache fingerprints.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a cached query: resource name plus its parameters.
///
/// Parameters live in a sorted map, so insertion order never matters, and
/// empty values are dropped on the way in, so `{level: ""}` and `{}` are the
/// same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
  resource: String,
  #[serde(default)]
  params: BTreeMap<String, String>,
}

impl ResourceKey {
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      params: BTreeMap::new(),
    }
  }

  /// Build a key from `(name, value)` pairs, skipping absent and empty values.
  pub fn from_pairs<I, K, V>(resource: impl Into<String>, pairs: I) -> Self
  where
    I: IntoIterator<Item = (K, Option<V>)>,
    K: Into<String>,
    V: ToString,
  {
    pairs
      .into_iter()
      .fold(Self::new(resource), |key, (name, value)| {
        key.with_opt_param(name, value)
      })
  }

  /// Add a parameter. An empty value removes the parameter instead.
  pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    let name = name.into();
    let value = value.to_string();
    if value.is_empty() {
      self.params.remove(&name);
    } else {
      self.params.insert(name, value);
    }
    self
  }

  pub fn with_opt_param<V: ToString>(self, name: impl Into<String>, value: Option<V>) -> Self {
    match value {
      Some(v) => self.with_param(name, v),
      None => {
        let name: String = name.into();
        let mut key = self;
        key.params.remove(&name);
        key
      }
    }
  }

  pub fn resource(&self) -> &str {
    &self.resource
  }

  pub fn param(&self, name: &str) -> Option<&str> {
    self.params.get(name).map(String::as_str)
  }

  pub fn params(&self) -> &BTreeMap<String, String> {
    &self.params
  }

  /// Parameters as query-string pairs, in sorted order.
  pub fn query_pairs(&self) -> Vec<(String, String)> {
    self
      .params
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  /// True when `other` has the same resource and carries every parameter of
  /// `self` with the same value. A bare resource key covers all its variants.
  pub fn covers(&self, other: &ResourceKey) -> bool {
    self.resource == other.resource
      && self
        .params
        .iter()
        .all(|(k, v)| other.params.get(k) == Some(v))
  }

  /// Stable, fixed-length hash of the canonical form.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human readable form for logs.
  pub fn description(&self) -> String {
    if self.params.is_empty() {
      return self.resource.clone();
    }
    let filters: Vec<String> = self
      .params
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect();
    format!("{} ({})", self.resource, filters.join(", "))
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.resource)?;
    for (i, (k, v)) in self.params.iter().enumerate() {
      let sep = if i == 0 { '?' } else { '&' };
      write!(f, "{}{}={}", sep, k, v)?;
    }
    Ok(())
  }
}
