//! Core data model for feed generation: articles, signals, publishers,
//! channels, topics, and the typed items a generated feed is assembled from.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One piece of fetched content. Immutable once fetched; cloned into
/// per-request working sets during generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub publisher_id: String,
    pub publisher_name: String,
    pub category: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    /// Articles without an image can never be picked as a hero.
    pub image: Option<String>,
    pub publish_time: DateTime<Utc>,
    pub pop_score: f64,
}

impl Article {
    pub fn has_image(&self) -> bool {
        self.image.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Aggregate engagement/subscription statistics for one content group
/// (a publisher or a channel). Computed externally, keyed by group id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Signal {
    pub subscribed_weight: f64,
    pub visit_weight: f64,
    pub article_count: u32,
    pub disabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserEnabled {
    Enabled,
    NotModified,
    Disabled,
}

/// Channels a publisher belongs to, for one locale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocaleInfo {
    pub locale: String,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publisher {
    pub id: String,
    pub name: String,
    pub user_enabled: UserEnabled,
    pub locales: Vec<LocaleInfo>,
}

impl Publisher {
    pub fn is_enabled(&self) -> bool {
        self.user_enabled == UserEnabled::Enabled
    }

    /// Channels this publisher contributes to in the given locale.
    pub fn channels_for_locale(&self, locale: &str) -> &[String] {
        self.locales
            .iter()
            .find(|li| li.locale == locale)
            .map(|li| li.channels.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub subscribed_locales: Vec<String>,
}

/// A subscribable unit used as a weighting/sampling key: either a channel
/// (`is_channel == true`) or a publisher. Equality is by both fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentGroup {
    pub id: String,
    pub is_channel: bool,
}

impl ContentGroup {
    pub fn channel(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_channel: true,
        }
    }

    pub fn publisher(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_channel: false,
        }
    }
}

/// One article from an externally clustered topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicArticle {
    pub publisher_name: String,
    pub category: String,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub image: Option<String>,
}

/// A named group of related articles, ordered by relevance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub title: String,
    pub articles: Vec<TopicArticle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterKind {
    Channel,
    Topic,
}

/// An article rendered inside a cluster, keeping its hero/inline role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArticleElement {
    Hero(Article),
    Inline(Article),
}

/// One entry of an assembled feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedItem {
    Hero(Article),
    Inline(Article),
    Cluster {
        kind: ClusterKind,
        id: String,
        articles: Vec<ArticleElement>,
    },
    Advert,
    /// Publisher ids suggested for the user to follow.
    Discover(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedKind {
    Following,
    Channel(String),
    Publisher(String),
    All,
}

/// Why an assembled feed came back empty. Only ever set when `items` is
/// empty; the variants are mutually exclusive and checked in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedError {
    /// Publisher list is known, but nothing is subscribed.
    NoFeeds,
    /// No raw items were ever fetched.
    ConnectionError,
    /// Items were fetched but nothing survived filtering.
    NoArticles,
}

/// An assembled feed, immutable once returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub kind: FeedKind,
    pub items: Vec<FeedItem>,
    /// Fingerprint of the subscription state the feed was built from.
    pub source_hash: String,
    pub constructed_at: DateTime<Utc>,
    pub error: Option<FeedError>,
}

/// Which data categories one refresh cycle should re-fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSettings {
    pub feed: bool,
    pub signals: bool,
    pub suggested_publishers: bool,
    pub topics: bool,
}

impl UpdateSettings {
    /// True when this request already covers everything `other` asks for.
    pub fn is_sufficient_for(&self, other: &UpdateSettings) -> bool {
        !((other.feed && !self.feed)
            || (other.signals && !self.signals)
            || (other.suggested_publishers && !self.suggested_publishers)
            || (other.topics && !self.topics))
    }

    /// Union with a later request that shares the pending follow-up slot.
    pub fn merge(&mut self, other: &UpdateSettings) {
        self.feed |= other.feed;
        self.signals |= other.signals;
        self.suggested_publishers |= other.suggested_publishers;
        self.topics |= other.topics;
    }
}

pub type Publishers = HashMap<String, Publisher>;
pub type Channels = HashMap<String, Channel>;
pub type Signals = HashMap<String, Signal>;
pub type Etags = HashMap<String, String>;
