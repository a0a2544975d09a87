//! # Article Weight
//! Derives a scalar relevance weight per article from its associated
//! signals and a popularity/recency decay. Pure computation, no I/O.
//!
//! The signal list handed to [`article_weight`] must start with the
//! publisher's own signal; the visit component reads only that first entry.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use crate::config::FeedTuning;
use crate::types::{Article, ContentGroup, Signal};

/// Derived, per-generation weighting for one article. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleWeight {
    /// Popularity discounted by age.
    pub pop_recency: f64,
    /// Combined weighting used by roulette selection.
    pub weighting: f64,
    /// Whether the publisher has ever been visited.
    pub visited: bool,
    /// Whether any associated content group is subscribed.
    pub subscribed: bool,
    /// Content groups (publisher and channels) this article belongs to.
    pub content_groups: BTreeSet<ContentGroup>,
}

/// `multiplier * normalized_popularity * 0.5^(age_hours / half_life)`.
/// Articles published within the last five hours get a 2x boost.
pub fn pop_recency(article: &Article, now: DateTime<Utc>, tuning: &FeedTuning) -> f64 {
    let popularity = article.pop_score.min(100.0) / 100.0 + tuning.pop_score_min;
    let multiplier = if article.publish_time > now - Duration::hours(5) {
        2.0
    } else {
        1.0
    };
    let age_hours = (now - article.publish_time).num_seconds() as f64 / 3600.0;

    multiplier * popularity * 0.5_f64.powf(age_hours / tuning.pop_score_half_life_hours)
}

/// Sum of `subscribed_weight / article_count` over the associated signals.
/// Signals with no articles contribute nothing.
fn subscribed_weight(signals: &[&Signal]) -> f64 {
    signals
        .iter()
        .filter(|s| s.article_count > 0)
        .map(|s| s.subscribed_weight / f64::from(s.article_count))
        .sum()
}

/// Compute the full [`ArticleWeight`] for an article.
///
/// Panics if `signals` is empty: every article reaching this point must
/// carry at least the signal of its own publisher.
pub fn article_weight(
    article: &Article,
    signals: &[&Signal],
    content_groups: BTreeSet<ContentGroup>,
    now: DateTime<Utc>,
    tuning: &FeedTuning,
) -> ArticleWeight {
    assert!(
        !signals.is_empty(),
        "article {} has no publisher signal",
        article.url
    );

    let subscribed = subscribed_weight(signals);
    // Only the publisher's signal (always first) carries the visit weight.
    let source_visits_projected =
        tuning.source_visits_min + signals[0].visit_weight * (1.0 - tuning.source_visits_min);
    let pop_recency = pop_recency(article, now, tuning);

    ArticleWeight {
        pop_recency,
        weighting: source_visits_projected + subscribed + pop_recency,
        visited: signals[0].visit_weight != 0.0,
        subscribed: subscribed != 0.0,
        content_groups,
    }
}
