//! # Feed Tuning
//!
//! Tunable parameters for weighting and block composition.
//!
//! - Loads from a JSON file, falling back to compiled defaults.
//! - An optional process-wide registry (`init_global` / `global`) holds one
//!   immutable copy behind synchronized one-time initialization, for hosts
//!   that configure the engine once at startup.

use std::{fs, path::Path};

use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::warn;

/// Channel used for the top-news opener cluster when no topics exist.
pub const TOP_NEWS_CHANNEL: &str = "Top News";

/// Identifier of the catch-all pseudo content group.
pub const ALL_CONTENT_GROUP: &str = "all";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedTuning {
    /// Half-life, in hours, of an article's popularity score.
    #[serde(default = "default_half_life")]
    pub pop_score_half_life_hours: f64,
    /// Floor added to the normalized popularity so stale articles keep a
    /// small nonzero chance of selection.
    #[serde(default = "default_pop_score_min")]
    pub pop_score_min: f64,
    /// Floor for the projected source-visits component.
    #[serde(default = "default_source_visits_min")]
    pub source_visits_min: f64,
    /// Minimum number of inline cards in one block.
    #[serde(default = "default_min_block_cards")]
    pub min_block_cards: u32,
    /// Maximum (inclusive) number of inline cards in one block.
    #[serde(default = "default_max_block_cards")]
    pub max_block_cards: u32,
    /// Share of inline cards picked with discovery weighting instead of the
    /// sampled content group.
    #[serde(default = "default_inline_discovery_ratio")]
    pub inline_discovery_ratio: f64,
    /// Probability that a cluster block is a channel cluster rather than a
    /// topic cluster.
    #[serde(default = "default_category_topic_ratio")]
    pub category_topic_ratio: f64,
}

fn default_half_life() -> f64 {
    18.0
}
fn default_pop_score_min() -> f64 {
    0.18
}
fn default_source_visits_min() -> f64 {
    0.2
}
fn default_min_block_cards() -> u32 {
    1
}
fn default_max_block_cards() -> u32 {
    4
}
fn default_inline_discovery_ratio() -> f64 {
    0.25
}
fn default_category_topic_ratio() -> f64 {
    0.5
}

impl Default for FeedTuning {
    fn default() -> Self {
        Self {
            pop_score_half_life_hours: default_half_life(),
            pop_score_min: default_pop_score_min(),
            source_visits_min: default_source_visits_min(),
            min_block_cards: default_min_block_cards(),
            max_block_cards: default_max_block_cards(),
            inline_discovery_ratio: default_inline_discovery_ratio(),
            category_topic_ratio: default_category_topic_ratio(),
        }
    }
}

impl FeedTuning {
    /// Load tuning from a JSON file.
    /// Falls back to `FeedTuning::default()` on any error.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                warn!(error = %e, "tuning file unparsable, using defaults");
                Self::default()
            }),
            Err(e) => {
                warn!(error = %e, "tuning file unreadable, using defaults");
                Self::default()
            }
        }
    }
}

static GLOBAL_TUNING: OnceCell<FeedTuning> = OnceCell::new();

/// Install the process-wide tuning. Returns `Err` with the rejected value if
/// a tuning has already been installed.
pub fn init_global(tuning: FeedTuning) -> Result<(), FeedTuning> {
    GLOBAL_TUNING.set(tuning)
}

/// The process-wide tuning; defaults are installed on first access if the
/// host never called [`init_global`].
pub fn global() -> &'static FeedTuning {
    GLOBAL_TUNING.get_or_init(FeedTuning::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let t = FeedTuning::default();
        assert!(t.pop_score_half_life_hours > 0.0);
        assert!(t.min_block_cards <= t.max_block_cards);
        assert!((0.0..=1.0).contains(&t.inline_discovery_ratio));
        assert!((0.0..=1.0).contains(&t.category_topic_ratio));
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let t: FeedTuning = serde_json::from_str(r#"{"pop_score_half_life_hours": 6.0}"#)
            .expect("parse tuning");
        assert_eq!(t.pop_score_half_life_hours, 6.0);
        assert_eq!(t.max_block_cards, default_max_block_cards());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let t = FeedTuning::load_from_file("definitely/not/here.json");
        assert_eq!(t, FeedTuning::default());
    }
}
