#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use feedtally::{
    cache::{CacheConfig, Clock, CounterAggregator, FollowerCache, KvStore, ManualClock},
    domain::values::TagName,
    infra::memory::{InMemoryRepositories, MemoryKv},
};
use time::macros::datetime;

/// Shared in-memory backends driven by one manual clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub kv: Arc<MemoryKv>,
    pub repos: Arc<InMemoryRepositories>,
    pub config: CacheConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 12:00 UTC)));
        let kv = Arc::new(MemoryKv::with_clock(clock.clone() as Arc<dyn Clock>));
        Self {
            clock,
            kv,
            repos: Arc::new(InMemoryRepositories::new()),
            config,
        }
    }

    pub fn kv_store(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn counters(&self) -> Arc<CounterAggregator> {
        Arc::new(CounterAggregator::new(self.kv_store(), &self.config))
    }

    pub fn followers(&self) -> FollowerCache {
        FollowerCache::new(self.kv_store(), self.clock(), &self.config)
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

pub fn tag(raw: &str) -> TagName {
    TagName::parse(raw).expect("valid tag name")
}

pub fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|id| id.to_string()).collect()
}
