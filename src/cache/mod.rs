//! Engagement caches.
//!
//! Every component sits on a [`KvStore`] and fails open: a store error is
//! logged and counted, then the caller gets an empty or zero result rather
//! than an error.
//!
//! - [`FollowerCache`]: follower projections with primary/backup tiers
//! - [`CounterAggregator`]: view, share and click counters
//! - [`PopularityTracker`]: tag counts mirrored from the durable store
//! - [`TrendingCache`]: refresh-ahead trending hashtags
//! - [`SuggestionIndex`]: search suggestions and per-user history
//!
//! ## Configuration
//!
//! TTLs and caps come from the `[cache]` section of `feedtally.toml`:
//!
//! ```toml
//! [cache]
//! follower_ttl_seconds = 300
//! follower_backup_ttl_seconds = 3600
//! trending_ttl_seconds = 3600
//! # ... see config.rs for all options
//! ```

mod clock;
pub mod codec;
mod config;
mod counters;
mod followers;
mod keys;
pub mod kv;
mod popularity;
mod suggestions;
mod tiered;
mod trending;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, MIN_BACKUP_TTL_FACTOR, backup_ttl_is_sufficient};
pub use counters::CounterAggregator;
pub use followers::{FollowerCache, FollowerKey, FollowerProjection};
pub use keys::CacheKey;
pub use kv::{KvError, KvExt, KvStore, Order, Pipeline, Replies, Reply};
pub use popularity::{PopularityError, PopularityTracker};
pub use suggestions::SuggestionIndex;
pub use tiered::{Projection, Tier, TieredCache};
pub use trending::{Freshness, TrendingCache, WarmOutcome};

pub(crate) use config::{
    DEFAULT_FOLLOWER_BACKUP_TTL_SECS, DEFAULT_FOLLOWER_TTL_SECS, DEFAULT_HISTORY_LIMIT,
    DEFAULT_HISTORY_TTL_SECS, DEFAULT_SCAN_PAGE_SIZE, DEFAULT_SHARE_STAT_TTL_SECS,
    DEFAULT_SUGGESTIONS_LIMIT, DEFAULT_SUGGESTIONS_TTL_SECS, DEFAULT_TRENDING_BACKUP_TTL_SECS,
    DEFAULT_TRENDING_LIMIT, DEFAULT_TRENDING_TTL_SECS, DEFAULT_TRENDING_WINDOW_SECS,
    DEFAULT_VIEW_COUNTER_TTL_SECS,
};
pub(crate) use counters::METRIC_VIEW_INCREMENT_TOTAL;
pub(crate) use kv::METRIC_KV_ERROR_TOTAL;
pub(crate) use tiered::{METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL};
pub(crate) use trending::METRIC_TRENDING_REFRESH_TOTAL;
