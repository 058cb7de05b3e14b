use crate::key::{OverrideRule, SourceKey};
use std::path::PathBuf;

/// Maps a source key to a local directory, or reports that no override
/// exists. `Ok(None)` is the normal "no override" outcome and is distinct
/// from failure.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, key: &SourceKey) -> anyhow::Result<Option<PathBuf>>;
}

/// Resolves overrides from a registered rule list. First match wins.
#[derive(Clone, Debug, Default)]
pub struct RuleResolver {
    rules: Vec<OverrideRule>,
}

// === impl RuleResolver ===

impl RuleResolver {
    pub fn new(rules: Vec<OverrideRule>) -> Self {
        Self { rules }
    }

    pub fn add_rule(&mut self, rule: OverrideRule) {
        self.rules.push(rule);
    }
}

#[async_trait::async_trait]
impl Resolver for RuleResolver {
    async fn resolve(&self, key: &SourceKey) -> anyhow::Result<Option<PathBuf>> {
        Ok(self
            .rules
            .iter()
            .find(|rule| rule.matches(key))
            .map(|rule| rule.path().to_path_buf()))
    }
}
