use async_trait::async_trait;
use parking_lot::Mutex;

use superplane::authz::{PolicyRule, PolicyStore};
use superplane::error::Result;

/// Policy rules kept in insertion order.
#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    rules: Mutex<Vec<PolicyRule>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, as a bootstrap file would.
    pub fn with_rules(rules: Vec<PolicyRule>) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        self.rules.lock().clone()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn load(&self) -> Result<Vec<PolicyRule>> {
        Ok(self.rules())
    }

    async fn add(&self, rules: &[PolicyRule]) -> Result<()> {
        let mut stored = self.rules.lock();
        for rule in rules {
            if !stored.contains(rule) {
                stored.push(rule.clone());
            }
        }
        Ok(())
    }

    async fn remove(&self, rules: &[PolicyRule]) -> Result<()> {
        self.rules.lock().retain(|r| !rules.contains(r));
        Ok(())
    }
}
