//! # Sample Definitions
//!
//! Sample index type and the ordered sample set of a run. Matrix dimension
//! `i` always refers to `Samples[SampleIdx(i)]`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Zero-cost newtype for sample indices
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SampleIdx(pub u32);

impl SampleIdx {
    pub fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }
}

impl From<u32> for SampleIdx {
    fn from(idx: u32) -> Self {
        Self(idx)
    }
}

impl From<usize> for SampleIdx {
    fn from(idx: usize) -> Self {
        Self(idx as u32)
    }
}

impl From<SampleIdx> for usize {
    fn from(idx: SampleIdx) -> usize {
        idx.0 as usize
    }
}

/// Ordered, immutable sample set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Samples {
    ids: Vec<Arc<str>>,
    id_to_idx: HashMap<Arc<str>, SampleIdx>,
}

impl Samples {
    pub fn from_ids<S: AsRef<str>>(ids: &[S]) -> Self {
        let ids: Vec<Arc<str>> = ids.iter().map(|s| Arc::from(s.as_ref())).collect();
        let id_to_idx = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (Arc::clone(id), SampleIdx::from(i)))
            .collect();
        Self { ids, id_to_idx }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[Arc<str>] {
        &self.ids
    }

    /// Index of the sample named `id`
    pub fn index_of(&self, id: &str) -> Option<SampleIdx> {
        self.id_to_idx.get(id).copied()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.ids.iter().map(|s| s.to_string()).collect()
    }
}

impl std::ops::Index<SampleIdx> for Samples {
    type Output = str;

    fn index(&self, idx: SampleIdx) -> &str {
        &self.ids[idx.as_usize()]
    }
}

impl Serialize for Samples {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.ids.iter().map(|s| s.as_ref()))
    }
}

impl<'de> Deserialize<'de> for Samples {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let ids = Vec::<String>::deserialize(deserializer)?;
        Ok(Self::from_ids(&ids))
    }
}
