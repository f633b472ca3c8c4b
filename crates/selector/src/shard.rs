use shardq_core::{ShardSelector, SHARD_LABEL};

use crate::{MatchType, Matcher, SelectorError, VectorSelector};

impl VectorSelector {
    /// Copy of this selector restricted to one shard: the shard matcher goes
    /// first, the metric name and original matchers are kept as they are.
    pub fn with_shard(&self, shard: ShardSelector) -> VectorSelector {
        let mut matchers = Vec::with_capacity(self.matchers.len() + 1);
        matchers.push(Matcher::equal(SHARD_LABEL, shard.label_value()));
        matchers.extend(self.matchers.iter().cloned());
        VectorSelector { name: self.name.clone(), matchers }
    }

    /// The shard this selector is restricted to, if any.
    pub fn shard(&self) -> Result<Option<ShardSelector>, SelectorError> {
        self.matchers
            .iter()
            .find(|m| m.name == SHARD_LABEL && m.kind == MatchType::Equal)
            .map(|m| ShardSelector::from_label_value(&m.value).map_err(SelectorError::from))
            .transpose()
    }

    /// This selector with every shard matcher removed.
    pub fn without_shard(&self) -> VectorSelector {
        let matchers = self.matchers.iter().filter(|m| m.name != SHARD_LABEL).cloned().collect();
        VectorSelector { name: self.name.clone(), matchers }
    }
}

/// One rewritten selector per shard index in `0..count`.
pub fn sharded_selectors(selector: &VectorSelector, count: usize) -> Vec<VectorSelector> {
    (0..count as u64).map(|i| selector.with_shard(ShardSelector::new(i, count as u64))).collect()
}
