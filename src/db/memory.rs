//! In-memory state store for replays and tests.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::StateStore;
use crate::models::CycleState;

/// State store that keeps every pair in a map.
#[derive(Default)]
pub struct MemoryStore {
    states: RwLock<HashMap<String, CycleState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `pair` with a state.
    #[cfg(test)]
    pub async fn with_state(self, pair: &str, state: CycleState) -> Self {
        self.states.write().await.insert(pair.to_string(), state);
        self
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, pair: &str) -> Result<CycleState> {
        Ok(self
            .states
            .read()
            .await
            .get(pair)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, pair: &str, state: &CycleState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(pair.to_string(), state.clone());
        Ok(())
    }
}
