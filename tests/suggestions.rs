mod support;

use std::time::Duration;

use feedtally::{
    cache::{CacheConfig, CacheKey, Clock, SuggestionIndex},
    domain::entities::SearchSuggestion,
};
use support::Harness;

fn index(harness: &Harness) -> SuggestionIndex {
    SuggestionIndex::new(harness.kv_store(), harness.clock(), &harness.config)
}

fn queries(suggestions: &[SearchSuggestion]) -> Vec<(&str, u64)> {
    suggestions
        .iter()
        .map(|s| (s.query.as_str(), s.count))
        .collect()
}

#[tokio::test]
async fn suggestions_rank_by_search_count() {
    let harness = Harness::new();
    let index = index(&harness);
    for query in ["rust async", "Rust  Async", "rust traits", "go modules"] {
        index.add_suggestion(query).await;
    }

    let all = index.get_suggestions("", 10).await;
    assert_eq!(
        queries(&all),
        vec![("rust async", 2), ("go modules", 1), ("rust traits", 1)]
    );

    let rust = index.get_suggestions("RUST", 10).await;
    assert_eq!(queries(&rust), vec![("rust async", 2), ("rust traits", 1)]);
    assert_eq!(index.get_suggestions("rust", 1).await.len(), 1);
    assert!(index.get_suggestions("zig", 10).await.is_empty());
}

#[tokio::test]
async fn suggestion_table_keeps_only_the_most_searched() {
    let harness = Harness::with_config(CacheConfig {
        suggestions_limit: 2,
        ..CacheConfig::default()
    });
    let index = index(&harness);
    for _ in 0..3 {
        index.add_suggestion("alpha").await;
    }
    for _ in 0..2 {
        index.add_suggestion("beta").await;
    }
    index.add_suggestion("gamma").await;

    let all = index.get_suggestions("", 10).await;
    assert_eq!(queries(&all), vec![("alpha", 3), ("beta", 2)]);
}

#[tokio::test]
async fn blank_queries_are_ignored() {
    let harness = Harness::new();
    let index = index(&harness);

    index.add_suggestion("   ").await;
    index.add_to_history("u1", "").await;
    index.record_search(Some("u1"), "\t").await;

    assert_eq!(harness.kv.round_trips(), 0);
    assert!(index.get_suggestions("", 10).await.is_empty());
    assert!(index.get_history("u1").await.is_empty());
}

#[tokio::test]
async fn history_lists_recent_searches_first() {
    let harness = Harness::with_config(CacheConfig {
        history_limit: 3,
        ..CacheConfig::default()
    });
    let index = index(&harness);
    for query in ["one", "two", "three", "four"] {
        index.add_to_history("u1", query).await;
        harness.advance(Duration::from_secs(1));
    }

    assert_eq!(index.get_history("u1").await, vec!["four", "three", "two"]);

    // Searching again moves the query to the front.
    index.add_to_history("u1", "two").await;
    assert_eq!(index.get_history("u1").await, vec!["two", "four", "three"]);

    let entries = index.get_history_entries("u1").await;
    assert_eq!(entries[0].searched_at, harness.clock.now());
    assert!(index.get_history("u2").await.is_empty());
}

#[tokio::test]
async fn history_items_can_be_removed_and_cleared() {
    let harness = Harness::new();
    let index = index(&harness);
    for query in ["one", "two", "three"] {
        index.add_to_history("u1", query).await;
        harness.advance(Duration::from_secs(1));
    }

    index.remove_history_item("u1", "TWO").await;
    assert_eq!(index.get_history("u1").await, vec!["three", "one"]);

    index.clear_history("u1").await;
    assert!(index.get_history("u1").await.is_empty());
    assert!(
        !harness
            .kv
            .contains_key(CacheKey::search_history("u1").as_str())
    );
}

#[tokio::test]
async fn record_search_feeds_both_tables_in_one_round_trip() {
    let harness = Harness::new();
    let index = index(&harness);

    index.record_search(Some("u1"), "Rust").await;
    assert_eq!(harness.kv.round_trips(), 1);
    index.record_search(None, "rust").await;

    assert_eq!(
        queries(&index.get_suggestions("", 10).await),
        vec![("rust", 2)]
    );
    assert_eq!(index.get_history("u1").await, vec!["rust"]);
}

#[tokio::test]
async fn history_expires_with_its_ttl() {
    let harness = Harness::new();
    let index = index(&harness);
    index.add_to_history("u1", "rust").await;

    harness.advance(harness.config.history_ttl + Duration::from_secs(1));

    assert!(index.get_history("u1").await.is_empty());
}
