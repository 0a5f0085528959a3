//! Cache configuration.
//!
//! TTLs and caps for every engagement cache, resolved from the `[cache]`
//! section of `feedtally.toml`.

use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

pub(crate) const DEFAULT_FOLLOWER_TTL_SECS: u64 = 5 * MINUTE;
pub(crate) const DEFAULT_FOLLOWER_BACKUP_TTL_SECS: u64 = HOUR;
pub(crate) const DEFAULT_VIEW_COUNTER_TTL_SECS: u64 = 7 * DAY;
pub(crate) const DEFAULT_SHARE_STAT_TTL_SECS: u64 = DAY;
pub(crate) const DEFAULT_TRENDING_TTL_SECS: u64 = HOUR;
pub(crate) const DEFAULT_TRENDING_BACKUP_TTL_SECS: u64 = DAY;
pub(crate) const DEFAULT_TRENDING_WINDOW_SECS: u64 = DAY;
pub(crate) const DEFAULT_TRENDING_LIMIT: usize = 20;
pub(crate) const DEFAULT_SUGGESTIONS_TTL_SECS: u64 = 7 * DAY;
pub(crate) const DEFAULT_SUGGESTIONS_LIMIT: usize = 100;
pub(crate) const DEFAULT_HISTORY_TTL_SECS: u64 = 30 * DAY;
pub(crate) const DEFAULT_HISTORY_LIMIT: usize = 10;
pub(crate) const DEFAULT_SCAN_PAGE_SIZE: usize = 250;

/// Backups must outlive their primary by at least this factor.
pub const MIN_BACKUP_TTL_FACTOR: u32 = 4;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Primary follower projection TTL.
    pub follower_ttl: Duration,
    /// Backup follower projection TTL.
    pub follower_backup_ttl: Duration,
    /// Rolling TTL of a view counter, refreshed on every increment.
    pub view_counter_ttl: Duration,
    /// Rolling TTL of each share/click counter.
    pub share_stat_ttl: Duration,
    /// Primary trending list TTL; staleness starts at half of it.
    pub trending_ttl: Duration,
    /// Backup trending snapshot TTL.
    pub trending_backup_ttl: Duration,
    /// How far back the durable store looks when ranking hashtags.
    pub trending_window: Duration,
    /// Number of topics kept per refresh.
    pub trending_limit: usize,
    /// Rolling TTL of the global suggestion table.
    pub suggestions_ttl: Duration,
    /// Number of global suggestions kept after trimming.
    pub suggestions_limit: usize,
    /// Rolling TTL of a user's search history.
    pub history_ttl: Duration,
    /// Number of history entries kept per user.
    pub history_limit: usize,
    /// COUNT hint for sorted-set scans.
    pub scan_page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            follower_ttl: Duration::from_secs(DEFAULT_FOLLOWER_TTL_SECS),
            follower_backup_ttl: Duration::from_secs(DEFAULT_FOLLOWER_BACKUP_TTL_SECS),
            view_counter_ttl: Duration::from_secs(DEFAULT_VIEW_COUNTER_TTL_SECS),
            share_stat_ttl: Duration::from_secs(DEFAULT_SHARE_STAT_TTL_SECS),
            trending_ttl: Duration::from_secs(DEFAULT_TRENDING_TTL_SECS),
            trending_backup_ttl: Duration::from_secs(DEFAULT_TRENDING_BACKUP_TTL_SECS),
            trending_window: Duration::from_secs(DEFAULT_TRENDING_WINDOW_SECS),
            trending_limit: DEFAULT_TRENDING_LIMIT,
            suggestions_ttl: Duration::from_secs(DEFAULT_SUGGESTIONS_TTL_SECS),
            suggestions_limit: DEFAULT_SUGGESTIONS_LIMIT,
            history_ttl: Duration::from_secs(DEFAULT_HISTORY_TTL_SECS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            follower_ttl: settings.follower_ttl,
            follower_backup_ttl: settings.follower_backup_ttl,
            view_counter_ttl: settings.view_counter_ttl,
            share_stat_ttl: settings.share_stat_ttl,
            trending_ttl: settings.trending_ttl,
            trending_backup_ttl: settings.trending_backup_ttl,
            trending_window: settings.trending_window,
            trending_limit: settings.trending_limit,
            suggestions_ttl: settings.suggestions_ttl,
            suggestions_limit: settings.suggestions_limit,
            history_ttl: settings.history_ttl,
            history_limit: settings.history_limit,
            scan_page_size: settings.scan_page_size,
        }
    }
}

impl CacheConfig {
    /// Half of the trending TTL: past this age the list is stale.
    pub fn trending_refresh_after(&self) -> Duration {
        self.trending_ttl / 2
    }
}

/// Returns true when `backup` outlives `primary` by [`MIN_BACKUP_TTL_FACTOR`].
pub fn backup_ttl_is_sufficient(primary: Duration, backup: Duration) -> bool {
    primary
        .checked_mul(MIN_BACKUP_TTL_FACTOR)
        .is_some_and(|floor| backup >= floor)
}
