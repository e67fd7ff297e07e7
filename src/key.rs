// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Identifier and key types shared by the allocator and its caches.

use std::fmt;

use crate::{raise, Result};

/// Numeric identifier handed out by the allocator.
///
/// `Id::NONE` (zero) is reserved and never allocated; identifiers are drawn
/// from the configured `[min, max]` range, optionally ORed with a prefix
/// mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(pub u64);

impl Id {
    /// Sentinel meaning "no identifier".
    pub const NONE: Id = Id(0);

    pub fn is_none(self) -> bool {
        self == Id::NONE
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Id {
    fn from(v: u64) -> Self {
        Id(v)
    }
}

/// Key type the allocator hands identifiers to.
///
/// Implementations must be round-trippable: `put_key` applied to the output
/// of `get_key` yields an equivalent key. The canonical form returned by
/// `get_key` becomes part of a store path and therefore must be stable and
/// must not contain `/`. The `Display` form is for humans only.
pub trait AllocatorKey: fmt::Display + Send + Sync {
    /// Canonical string form of the key.
    fn get_key(&self) -> String;

    /// Reconstruct a key from its canonical string form.
    fn put_key(&self, raw: &str) -> Result<Box<dyn AllocatorKey>>;
}

/// Ready-made key type for callers whose keys already are canonical strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StringKey(String);

impl StringKey {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            raise!("allocator keys must not be empty");
        }
        if raw.contains('/') {
            raise!("allocator keys must not contain '/': {raw:?}");
        }
        Ok(StringKey(raw))
    }
}

impl fmt::Display for StringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AllocatorKey for StringKey {
    fn get_key(&self) -> String {
        self.0.clone()
    }

    fn put_key(&self, raw: &str) -> Result<Box<dyn AllocatorKey>> {
        Ok(Box::new(StringKey::new(raw)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_none_is_zero() {
        assert!(Id::NONE.is_none());
        assert!(!Id(1).is_none());
        assert_eq!(Id::from(7).as_u64(), 7);
    }

    #[test]
    fn string_key_round_trips() {
        let key = StringKey::new("label;foo;").unwrap();
        let back = key.put_key(&key.get_key()).unwrap();
        assert_eq!(back.get_key(), "label;foo;");
    }

    #[test]
    fn string_key_rejects_path_separators() {
        assert!(StringKey::new("a/b").is_err());
        assert!(StringKey::new("").is_err());
    }
}
