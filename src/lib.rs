// src/lib.rs
// Public library surface for hosts and integration tests.

pub mod blocks;
pub mod builder;
pub mod config;
pub mod hash;
pub mod info;
pub mod pick;
pub mod types;
pub mod weight;

// ---- Re-exports for stable public API ----
pub use crate::builder::{
    FeedFetcher, FeedSnapshot, FeedV2Builder, ListenerHandle, PublisherProvider, SignalCalculator,
    SuggestionsProvider, TopicsFetcher,
};
pub use crate::config::FeedTuning;
pub use crate::types::{
    Article, ArticleElement, Channel, Channels, ClusterKind, ContentGroup, Etags, Feed, FeedError,
    FeedItem, FeedKind, LocaleInfo, Publisher, Publishers, Signal, Signals, Topic, TopicArticle,
    UpdateSettings, UserEnabled,
};
