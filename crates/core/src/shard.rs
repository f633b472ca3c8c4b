//! Shard descriptors and the label encoding used to route selectors to them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One shard out of `count`, zero-based.
///
/// The label value form is `"{index + 1}_of_{count}"` and is part of the wire
/// contract with upstream queriers; it must not change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ShardSelector {
    pub index: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardLabelError {
    #[error("invalid shard label value {0:?}: expected <index>_of_<count>")]
    Format(String),
    #[error("invalid shard label value {0:?}: index must be in 1..=count")]
    OutOfRange(String),
}

impl ShardSelector {
    pub fn new(index: u64, count: u64) -> Self { Self { index, count } }

    pub fn label_value(&self) -> String {
        format!("{}_of_{}", self.index + 1, self.count)
    }

    pub fn from_label_value(value: &str) -> Result<Self, ShardLabelError> {
        let (index, count) = value
            .split_once("_of_")
            .ok_or_else(|| ShardLabelError::Format(value.to_string()))?;
        let index = u64::from_str(index).map_err(|_| ShardLabelError::Format(value.to_string()))?;
        let count = u64::from_str(count).map_err(|_| ShardLabelError::Format(value.to_string()))?;
        if index == 0 || index > count {
            return Err(ShardLabelError::OutOfRange(value.to_string()));
        }
        Ok(Self { index: index - 1, count })
    }

    /// Whether a series with the given stable hash belongs to this shard.
    pub fn owns(&self, hash: u64) -> bool {
        self.count > 0 && hash % self.count == self.index
    }
}

impl fmt::Display for ShardSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_of_{}", self.index + 1, self.count)
    }
}

/// Order-independent 64-bit FNV-1a hash of a label set.
///
/// Pairs are hashed in name order as `name 0xff value 0xff`, so the same
/// series always lands on the same shard regardless of field order.
pub fn stable_hash<'a, I>(labels: I) -> u64
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut pairs: Vec<(&str, &str)> = labels.into_iter().collect();
    pairs.sort_unstable();
    let mut h: u64 = 0xcbf29ce484222325;
    let mut feed = |bytes: &[u8]| {
        for b in bytes { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
    };
    for (name, value) in pairs {
        feed(name.as_bytes());
        feed(&[0xff]);
        feed(value.as_bytes());
        feed(&[0xff]);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_value_is_one_based() {
        assert_eq!(ShardSelector::new(0, 4).label_value(), "1_of_4");
        assert_eq!(ShardSelector::new(3, 4).to_string(), "4_of_4");
    }

    #[test]
    fn parses_label_value() {
        assert_eq!(ShardSelector::from_label_value("2_of_16").expect("ok"), ShardSelector::new(1, 16));
        assert!(matches!(ShardSelector::from_label_value("0_of_4"), Err(ShardLabelError::OutOfRange(_))));
        assert!(matches!(ShardSelector::from_label_value("5_of_4"), Err(ShardLabelError::OutOfRange(_))));
        assert!(matches!(ShardSelector::from_label_value("two_of_4"), Err(ShardLabelError::Format(_))));
        assert!(matches!(ShardSelector::from_label_value("2-4"), Err(ShardLabelError::Format(_))));
    }

    #[test]
    fn every_hash_has_exactly_one_owner() {
        let count = 7;
        for n in 0..500u64 {
            let v = n.to_string();
            let h = stable_hash([("__name__", "up"), ("instance", v.as_str())]);
            let owners = (0..count).filter(|i| ShardSelector::new(*i, count).owns(h)).count();
            assert_eq!(owners, 1);
        }
    }

    #[test]
    fn stable_hash_ignores_field_order() {
        let a = stable_hash([("job", "api"), ("__name__", "up")]);
        let b = stable_hash([("__name__", "up"), ("job", "api")]);
        assert_eq!(a, b);
        assert_ne!(a, stable_hash([("__name__", "up"), ("job", "db")]));
    }

    #[test]
    fn stable_hash_separates_name_and_value() {
        assert_ne!(stable_hash([("ab", "c")]), stable_hash([("a", "bc")]));
    }
}
