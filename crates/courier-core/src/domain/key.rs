//! Message keys and name normalization.
//!
//! A message key is the routing key on the wire. Unless a message type sets one
//! explicitly, it is derived from the type name with [`underscore`].

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKey(String);

impl MessageKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Default key for a Rust type: the underscored short type name.
    pub fn for_type<T: ?Sized>() -> Self {
        Self(underscore(short_type_name::<T>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for MessageKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for MessageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Convert a camel-cased name to snake case.
///
/// `::` becomes `/`, a run of capitals followed by a capitalized word is split
/// before the word (`HTTPRequest` -> `http_request`), a lowercase letter or
/// digit followed by a capital is split (`orderId` -> `order_id`), and `-`
/// becomes `_`.
pub fn underscore(word: &str) -> String {
    let word = word.replace("::", "/");
    let chars: Vec<char> = word.chars().collect();
    let mut out = String::with_capacity(word.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next = chars.get(i + 1).copied();
            let camel_hump = prev.is_ascii_lowercase() || prev.is_ascii_digit();
            let acronym_end =
                prev.is_ascii_uppercase() && next.is_some_and(|n| n.is_ascii_lowercase());
            if camel_hump || acronym_end {
                out.push('_');
            }
        }
        match c {
            '-' => out.push('_'),
            c => out.push(c.to_ascii_lowercase()),
        }
    }
    out
}

/// Name used for handler types in queue names: underscored, with path
/// separators flattened.
pub fn normalized_name(name: &str) -> String {
    underscore(name).replace('/', "_")
}

/// `std::any::type_name` without the crate segment and generic arguments:
/// `shop::billing::OrderSaga<T>` becomes `billing::OrderSaga`.
pub fn type_path<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.split_once("::").map_or(base, |(_, path)| path)
}

/// Last path segment of `std::any::type_name`, without generic arguments.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
