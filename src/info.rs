//! # Feed Generation Info
//! The per-request working set consumed by block generators: a snapshot of
//! articles (with precomputed weights), publisher/channel/signal lookups and
//! the pending suggestion/topic queues. Articles are removed from the set as
//! they are picked, which is what keeps a feed free of duplicates.

use std::collections::{BTreeSet, HashSet, VecDeque};

use chrono::Utc;

use crate::config::FeedTuning;
use crate::pick::ArticleInfo;
use crate::types::{Article, Channels, ContentGroup, Publishers, Signal, Signals, Topic};
use crate::weight::article_weight;

/// Signals relevant to one article, publisher's first, plus the subscribed
/// content groups the article belongs to.
fn signals_and_groups<'a>(
    locale: &str,
    article: &Article,
    publishers: &Publishers,
    signals: &'a Signals,
) -> (Vec<&'a Signal>, BTreeSet<ContentGroup>) {
    let mut result_signals = Vec::new();
    let mut groups = BTreeSet::new();

    let publisher_signal = signals.get(&article.publisher_id);
    if let Some(signal) = publisher_signal {
        result_signals.push(signal);
    }

    let Some(publisher) = publishers.get(&article.publisher_id) else {
        return (result_signals, groups);
    };

    if publisher_signal.is_some_and(|s| s.subscribed_weight != 0.0) {
        groups.insert(ContentGroup::publisher(publisher.id.as_str()));
    }

    for channel in publisher.channels_for_locale(locale) {
        let Some(signal) = signals.get(channel) else {
            continue;
        };
        result_signals.push(signal);
        if signal.subscribed_weight != 0.0 {
            groups.insert(ContentGroup::channel(channel.as_str()));
        }
    }

    (result_signals, groups)
}

/// Build the weighted candidate list for a generation run. Feeds fetched for
/// multiple locales can repeat an article, so URLs are deduplicated; articles
/// with no signal at all, or any disabled signal, are dropped.
pub fn article_infos(
    locale: &str,
    feed_items: &[Article],
    publishers: &Publishers,
    signals: &Signals,
    tuning: &FeedTuning,
) -> Vec<ArticleInfo> {
    let now = Utc::now();
    let mut seen_urls = HashSet::new();
    let mut result = Vec::new();

    for article in feed_items {
        if !seen_urls.insert(article.url.clone()) {
            continue;
        }

        let (article_signals, groups) = signals_and_groups(locale, article, publishers, signals);
        if article_signals.is_empty() || article_signals.iter().any(|s| s.disabled) {
            continue;
        }

        let weight = article_weight(article, &article_signals, groups, now, tuning);
        result.push((article.clone(), weight));
    }

    result
}

/// Read-only-by-convention snapshot for one feed build. Generators consume
/// articles, topics and suggestions from it; nothing is shared with the
/// orchestrator while a build is running.
pub struct FeedGenerationInfo {
    locale: String,
    articles: Vec<ArticleInfo>,
    publishers: Publishers,
    /// Channels subscribed in this locale.
    channels: Vec<String>,
    suggestion_ids: VecDeque<String>,
    topics: VecDeque<Topic>,
    content_groups: Option<Vec<ContentGroup>>,
    tuning: FeedTuning,
}

impl FeedGenerationInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        locale: String,
        feed_items: &[Article],
        publishers: Publishers,
        channels: &Channels,
        signals: &Signals,
        suggestion_ids: Vec<String>,
        topics: Vec<Topic>,
        tuning: FeedTuning,
    ) -> Self {
        let articles = article_infos(&locale, feed_items, &publishers, signals, &tuning);

        let subscribed_channels = channels
            .values()
            .filter(|c| c.subscribed_locales.iter().any(|l| l == &locale))
            .map(|c| c.name.clone())
            .collect();

        Self {
            locale,
            articles,
            publishers,
            channels: subscribed_channels,
            suggestion_ids: suggestion_ids.into(),
            topics: topics.into(),
            content_groups: None,
            tuning,
        }
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn articles(&self) -> &[ArticleInfo] {
        &self.articles
    }

    pub fn articles_mut(&mut self) -> &mut Vec<ArticleInfo> {
        &mut self.articles
    }

    pub fn publishers(&self) -> &Publishers {
        &self.publishers
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn topics(&self) -> &VecDeque<Topic> {
        &self.topics
    }

    /// Consume the front topic, so it is never reused within this feed.
    pub fn pop_topic(&mut self) -> Option<Topic> {
        self.topics.pop_front()
    }

    /// Consume up to `count` suggested publisher ids.
    pub fn take_suggestions(&mut self, count: usize) -> Vec<String> {
        let count = count.min(self.suggestion_ids.len());
        self.suggestion_ids.drain(..count).collect()
    }

    pub fn suggestions_remaining(&self) -> usize {
        self.suggestion_ids.len()
    }

    pub fn tuning(&self) -> &FeedTuning {
        &self.tuning
    }

    /// Groups a targeted block may be aimed at: enabled publishers plus the
    /// subscribed channels. Built lazily and cached for the feed's lifetime.
    pub fn content_groups(&mut self) -> &[ContentGroup] {
        self.content_groups.get_or_insert_with(|| {
            let mut groups: Vec<ContentGroup> = self
                .publishers
                .values()
                .filter(|p| p.is_enabled())
                .map(|p| ContentGroup::publisher(p.id.as_str()))
                .collect();
            groups.extend(self.channels.iter().map(|c| ContentGroup::channel(c.as_str())));
            groups
        })
    }
}
