//! # Feed Builder
//! Owns the fetch → signals → suggestions → topics pipeline, coalesces
//! concurrent update requests, and dispatches feed generation onto a
//! blocking worker over an immutable snapshot of its state.
//!
//! Exactly one update cycle runs at a time. A request arriving mid-cycle
//! either attaches to the running cycle (when that cycle already covers the
//! requested categories) or lands in the single pending follow-up slot,
//! whose categories are the union of everything queued. Each pipeline stage
//! is skipped when its cache is already populated; "refresh X" is therefore
//! spelled "clear the cache for X and run the pipeline".
//!
//! Completion does not wait for waiters to consume their result: each waiter
//! receives a frozen [`FeedSnapshot`], after which listeners are notified and
//! a queued follow-up cycle starts immediately. The snapshot is what keeps
//! feed generation isolated from the follow-up's cache clearing.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::blocks::{generate_all_feed, generate_basic_feed};
use crate::config::FeedTuning;
use crate::hash::feed_hash_and_subscribed_count;
use crate::info::FeedGenerationInfo;
use crate::pick::{pick_first, pick_roulette_with_weighting, subscribed_weighting, ArticleInfo};
use crate::types::{
    Article, Channels, Etags, Feed, FeedError, FeedItem, FeedKind, Publishers, Signals, Topic,
    UpdateSettings,
};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("feed_update_cycles_total", "Update pipeline cycles started.");
        describe_counter!(
            "feed_update_coalesced_total",
            "Requests attached to an already-running cycle."
        );
        describe_counter!(
            "feed_update_queued_total",
            "Requests merged into the pending follow-up cycle."
        );
        describe_counter!(
            "feed_collaborator_errors_total",
            "Collaborator fetch/compute errors (treated as empty results)."
        );
        describe_histogram!("feed_generation_ms", "Feed assembly time in milliseconds.");
        describe_gauge!(
            "feed_last_update_ts",
            "Unix ts when an update cycle last completed."
        );
    });
}

const POISONED: &str = "feed builder state mutex poisoned";

/// Source of raw feed items and their per-locale ETags.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch_feed(&self) -> Result<(Vec<Article>, Etags)>;
}

/// Computes engagement/subscription signals for the fetched items.
#[async_trait]
pub trait SignalCalculator: Send + Sync {
    async fn get_signals(&self, items: &[Article]) -> Result<Signals>;
}

/// Suggests publishers the user may want to follow.
#[async_trait]
pub trait SuggestionsProvider: Send + Sync {
    async fn suggested_publisher_ids(&self) -> Result<Vec<String>>;
}

/// Fetches externally clustered topics for a locale.
#[async_trait]
pub trait TopicsFetcher: Send + Sync {
    async fn get_topics(&self, locale: &str) -> Result<Vec<Topic>>;
}

/// The host's view of publishers and channels. Synchronous: the provider is
/// expected to serve from its own cache.
pub trait PublisherProvider: Send + Sync {
    fn last_publishers(&self) -> Publishers;
    fn last_locale(&self) -> String;
    fn channels_from_publishers(&self, publishers: &Publishers) -> Channels;
}

/// Read-only snapshot of builder state handed to waiters when an update
/// cycle completes. Generation works exclusively on this, never on live
/// builder state.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub locale: String,
    pub raw_feed_items: Vec<Article>,
    pub publishers: Publishers,
    pub channels: Channels,
    pub signals: Signals,
    pub suggested_publisher_ids: Vec<String>,
    pub topics: Vec<Topic>,
    pub hash: String,
    pub subscribed_count: usize,
    pub tuning: FeedTuning,
}

impl FeedSnapshot {
    fn generation_info(&self, feed_items: &[Article]) -> FeedGenerationInfo {
        FeedGenerationInfo::new(
            self.locale.clone(),
            feed_items,
            self.publishers.clone(),
            &self.channels,
            &self.signals,
            self.suggested_publisher_ids.clone(),
            self.topics.clone(),
            self.tuning.clone(),
        )
    }
}

struct UpdateCycle {
    settings: UpdateSettings,
    waiters: Vec<oneshot::Sender<Arc<FeedSnapshot>>>,
}

impl UpdateCycle {
    fn new(settings: UpdateSettings, waiter: oneshot::Sender<Arc<FeedSnapshot>>) -> Self {
        Self {
            settings,
            waiters: vec![waiter],
        }
    }
}

/// Single-flight discipline for the update pipeline. Modeled as a tagged
/// state rather than optional slots so a request can never be dropped on
/// the floor.
enum UpdateState {
    Idle,
    Running(UpdateCycle),
    RunningQueued(UpdateCycle, UpdateCycle),
}

struct BuilderState {
    raw_feed_items: Vec<Article>,
    etags: Etags,
    signals: Signals,
    suggested_publisher_ids: Vec<String>,
    topics: Vec<Topic>,
    hash: String,
    subscribed_count: usize,
    update: UpdateState,
    listeners: HashMap<u64, mpsc::UnboundedSender<String>>,
    next_listener_id: u64,
}

impl BuilderState {
    /// Clearing a cache is what forces its pipeline stage to re-run.
    fn clear_for(&mut self, settings: &UpdateSettings) {
        if settings.feed {
            self.raw_feed_items.clear();
        }
        if settings.signals {
            self.signals.clear();
        }
        if settings.suggested_publishers {
            self.suggested_publisher_ids.clear();
        }
        if settings.topics {
            self.topics.clear();
        }
    }
}

struct BuilderInner {
    publishers: Arc<dyn PublisherProvider>,
    fetcher: Arc<dyn FeedFetcher>,
    signal_calculator: Arc<dyn SignalCalculator>,
    suggestions: Arc<dyn SuggestionsProvider>,
    topics_fetcher: Arc<dyn TopicsFetcher>,
    tuning: FeedTuning,
    state: Mutex<BuilderState>,
}

/// Handle to a registered hash listener; pass back to `remove_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

/// The feed assembly orchestrator. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct FeedV2Builder {
    inner: Arc<BuilderInner>,
}

impl FeedV2Builder {
    pub fn new(
        publishers: Arc<dyn PublisherProvider>,
        fetcher: Arc<dyn FeedFetcher>,
        signal_calculator: Arc<dyn SignalCalculator>,
        suggestions: Arc<dyn SuggestionsProvider>,
        topics_fetcher: Arc<dyn TopicsFetcher>,
        tuning: FeedTuning,
    ) -> Self {
        ensure_metrics_described();
        Self {
            inner: Arc::new(BuilderInner {
                publishers,
                fetcher,
                signal_calculator,
                suggestions,
                topics_fetcher,
                tuning,
                state: Mutex::new(BuilderState {
                    raw_feed_items: Vec::new(),
                    etags: Etags::new(),
                    signals: Signals::new(),
                    suggested_publisher_ids: Vec::new(),
                    topics: Vec::new(),
                    hash: String::new(),
                    subscribed_count: 0,
                    update: UpdateState::Idle,
                    listeners: HashMap::new(),
                    next_listener_id: 0,
                }),
            }),
        }
    }

    /// Current change-detection fingerprint.
    pub fn hash(&self) -> String {
        self.inner.state.lock().expect(POISONED).hash.clone()
    }

    /// Subscribe to fingerprint changes. The new listener immediately
    /// receives the current hash.
    pub fn add_listener(&self) -> (ListenerHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().expect(POISONED);
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        let _ = tx.send(state.hash.clone());
        state.listeners.insert(id, tx);
        (ListenerHandle(id), rx)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.inner
            .state
            .lock()
            .expect(POISONED)
            .listeners
            .remove(&handle.0);
    }

    /// Recompute the fingerprint from current publisher/channel/etag state
    /// and notify listeners. Hosts call this from their publisher-change
    /// observer.
    pub fn recheck_feed_hash(&self) {
        let publishers = self.inner.publishers.last_publishers();
        let channels = self.inner.publishers.channels_from_publishers(&publishers);
        let hash = {
            let mut state = self.inner.state.lock().expect(POISONED);
            let (hash, subscribed_count) =
                feed_hash_and_subscribed_count(&channels, &publishers, &state.etags);
            state.hash = hash.clone();
            state.subscribed_count = subscribed_count;
            hash
        };
        notify_listeners(&self.inner, &hash);
    }

    /// Kick off a full refresh without waiting for it.
    pub fn ensure_feed_is_updating(&self) {
        drop(self.update_data(UpdateSettings {
            feed: true,
            signals: true,
            suggested_publishers: true,
            topics: true,
        }));
    }

    /// Refresh signals if needed and return them.
    pub async fn get_signals(&self) -> Signals {
        let rx = self.update_data(UpdateSettings {
            signals: true,
            ..Default::default()
        });
        match rx.await {
            Ok(snapshot) => snapshot.signals.clone(),
            // Builder dropped mid-cycle; nothing to report.
            Err(_) => Signals::new(),
        }
    }

    /// Request an update covering `settings`. The returned receiver resolves
    /// with a state snapshot once a cycle covering the request completes, or
    /// errors if the builder is dropped first.
    pub fn update_data(
        &self,
        settings: UpdateSettings,
    ) -> oneshot::Receiver<Arc<FeedSnapshot>> {
        let (tx, rx) = oneshot::channel();

        let mut spawn_cycle = false;
        {
            let mut state = self.inner.state.lock().expect(POISONED);
            let update = mem::replace(&mut state.update, UpdateState::Idle);
            state.update = match update {
                UpdateState::Idle => {
                    state.clear_for(&settings);
                    spawn_cycle = true;
                    counter!("feed_update_cycles_total").increment(1);
                    UpdateState::Running(UpdateCycle::new(settings, tx))
                }
                UpdateState::Running(mut cycle) => {
                    if cycle.settings.is_sufficient_for(&settings) {
                        counter!("feed_update_coalesced_total").increment(1);
                        cycle.waiters.push(tx);
                        UpdateState::Running(cycle)
                    } else {
                        counter!("feed_update_queued_total").increment(1);
                        UpdateState::RunningQueued(cycle, UpdateCycle::new(settings, tx))
                    }
                }
                UpdateState::RunningQueued(mut cycle, mut pending) => {
                    if cycle.settings.is_sufficient_for(&settings) {
                        counter!("feed_update_coalesced_total").increment(1);
                        cycle.waiters.push(tx);
                    } else {
                        counter!("feed_update_queued_total").increment(1);
                        pending.settings.merge(&settings);
                        pending.waiters.push(tx);
                    }
                    UpdateState::RunningQueued(cycle, pending)
                }
            };
        }

        if spawn_cycle {
            tokio::spawn(run_update_cycle(Arc::downgrade(&self.inner)));
        }

        rx
    }

    /// Following feed: roulette over subscribed sources across all items.
    pub async fn build_following_feed(&self) -> Feed {
        self.generate_feed(
            UpdateSettings {
                signals: true,
                ..Default::default()
            },
            FeedKind::Following,
            |snapshot, rng| {
                let mut info = snapshot.generation_info(&snapshot.raw_feed_items);
                let mut pick_hero = |rng: &mut rand::rngs::StdRng, c: &[ArticleInfo]| {
                    pick_roulette_with_weighting(rng, c, subscribed_weighting)
                };
                let mut pick_article = |rng: &mut rand::rngs::StdRng, c: &[ArticleInfo]| {
                    pick_roulette_with_weighting(rng, c, subscribed_weighting)
                };
                generate_basic_feed(rng, &mut info, &mut pick_hero, &mut pick_article)
            },
        )
        .await
    }

    /// Feed restricted to one channel (in the current locale).
    pub async fn build_channel_feed(&self, channel: &str) -> Feed {
        let channel = channel.to_string();
        self.generate_feed(
            UpdateSettings {
                signals: true,
                ..Default::default()
            },
            FeedKind::Channel(channel.clone()),
            move |snapshot, rng| {
                let items: Vec<Article> = snapshot
                    .raw_feed_items
                    .iter()
                    .filter(|item| {
                        snapshot
                            .publishers
                            .get(&item.publisher_id)
                            .is_some_and(|p| {
                                p.channels_for_locale(&snapshot.locale)
                                    .iter()
                                    .any(|c| c == &channel)
                            })
                    })
                    .cloned()
                    .collect();

                let mut info = snapshot.generation_info(&items);
                let mut pick_hero = |rng: &mut rand::rngs::StdRng, c: &[ArticleInfo]| {
                    pick_roulette_with_weighting(rng, c, subscribed_weighting)
                };
                let mut pick_article = |rng: &mut rand::rngs::StdRng, c: &[ArticleInfo]| {
                    pick_roulette_with_weighting(rng, c, subscribed_weighting)
                };
                generate_basic_feed(rng, &mut info, &mut pick_hero, &mut pick_article)
            },
        )
        .await
    }

    /// Feed of one publisher's articles, newest first.
    pub async fn build_publisher_feed(&self, publisher_id: &str) -> Feed {
        let publisher_id = publisher_id.to_string();
        self.generate_feed(
            UpdateSettings {
                signals: true,
                ..Default::default()
            },
            FeedKind::Publisher(publisher_id.clone()),
            move |snapshot, rng| {
                let mut items: Vec<Article> = snapshot
                    .raw_feed_items
                    .iter()
                    .filter(|item| item.publisher_id == publisher_id)
                    .cloned()
                    .collect();
                items.sort_by(|a, b| b.publish_time.cmp(&a.publish_time));

                let mut info = snapshot.generation_info(&items);
                // Pre-sorted, so both pickers just take the front.
                let mut pick_hero =
                    |_rng: &mut rand::rngs::StdRng, c: &[ArticleInfo]| pick_first(c);
                let mut pick_article =
                    |_rng: &mut rand::rngs::StdRng, c: &[ArticleInfo]| pick_first(c);
                generate_basic_feed(rng, &mut info, &mut pick_hero, &mut pick_article)
            },
        )
        .await
    }

    /// The full "For You" feed built from sampled content groups, topics and
    /// discover suggestions.
    pub async fn build_all_feed(&self) -> Feed {
        self.generate_feed(
            UpdateSettings {
                signals: true,
                suggested_publishers: true,
                ..Default::default()
            },
            FeedKind::All,
            |snapshot, rng| {
                let mut info = snapshot.generation_info(&snapshot.raw_feed_items);
                generate_all_feed(rng, &mut info)
            },
        )
        .await
    }

    /// Run an update covering `settings`, then assemble a feed from the
    /// resulting snapshot on a blocking worker.
    async fn generate_feed<F>(&self, settings: UpdateSettings, kind: FeedKind, generate: F) -> Feed
    where
        F: FnOnce(&FeedSnapshot, &mut rand::rngs::StdRng) -> Vec<FeedItem> + Send + 'static,
    {
        let rx = self.update_data(settings);
        let snapshot = match rx.await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                // Builder dropped while the cycle was in flight.
                return Feed {
                    kind,
                    items: Vec::new(),
                    source_hash: String::new(),
                    constructed_at: Utc::now(),
                    error: None,
                };
            }
        };

        let started = Instant::now();
        let generation_snapshot = Arc::clone(&snapshot);
        let generated = tokio::task::spawn_blocking(move || {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::from_os_rng();
            generate(&generation_snapshot, &mut rng)
        })
        .await;
        histogram!("feed_generation_ms").record(started.elapsed().as_secs_f64() * 1000.0);

        let items = match generated {
            Ok(items) => items,
            Err(e) => {
                warn!(error = ?e, "feed generation task failed");
                Vec::new()
            }
        };

        let error = if items.is_empty() {
            Some(classify_empty_feed(&snapshot))
        } else {
            None
        };

        Feed {
            kind,
            items,
            source_hash: snapshot.hash.clone(),
            constructed_at: Utc::now(),
            error,
        }
    }
}

/// Why an assembled feed has no items; the checks are ordered by priority.
fn classify_empty_feed(snapshot: &FeedSnapshot) -> FeedError {
    if snapshot.subscribed_count == 0 && !snapshot.publishers.is_empty() {
        // Publisher list is known, nothing followed.
        FeedError::NoFeeds
    } else if snapshot.raw_feed_items.is_empty() {
        FeedError::ConnectionError
    } else {
        FeedError::NoArticles
    }
}

fn notify_listeners(inner: &Arc<BuilderInner>, hash: &str) {
    let mut state = inner.state.lock().expect(POISONED);
    // Dropped receivers unsubscribe implicitly.
    state
        .listeners
        .retain(|_, tx| tx.send(hash.to_string()).is_ok());
}

/// One pipeline cycle: fetch → signals → suggestions → topics → completion.
/// Stages whose cache is already populated are skipped. The task holds only
/// a weak reference between stages; a dropped builder ends the cycle.
async fn run_update_cycle(inner: Weak<BuilderInner>) {
    // Stage 1: raw feed items.
    let fetch = {
        let Some(strong) = inner.upgrade() else { return };
        let state = strong.state.lock().expect(POISONED);
        if state.raw_feed_items.is_empty() {
            Some(Arc::clone(&strong.fetcher))
        } else {
            debug!("feed cache warm, skipping fetch");
            None
        }
    };
    if let Some(fetcher) = fetch {
        let result = fetcher.fetch_feed().await;
        let Some(strong) = inner.upgrade() else { return };
        let mut state = strong.state.lock().expect(POISONED);
        match result {
            Ok((items, etags)) => {
                debug!(items = items.len(), "fetched feed");
                state.raw_feed_items = items;
                state.etags = etags;
            }
            Err(e) => {
                warn!(error = ?e, "feed fetch failed");
                counter!("feed_collaborator_errors_total").increment(1);
            }
        }
    }

    // Stage 2: signals.
    let calculate = {
        let Some(strong) = inner.upgrade() else { return };
        let state = strong.state.lock().expect(POISONED);
        if state.signals.is_empty() {
            Some((
                Arc::clone(&strong.signal_calculator),
                state.raw_feed_items.clone(),
            ))
        } else {
            debug!("signal cache warm, skipping calculation");
            None
        }
    };
    if let Some((calculator, items)) = calculate {
        let result = calculator.get_signals(&items).await;
        let Some(strong) = inner.upgrade() else { return };
        let mut state = strong.state.lock().expect(POISONED);
        match result {
            Ok(signals) => state.signals = signals,
            Err(e) => {
                warn!(error = ?e, "signal calculation failed");
                counter!("feed_collaborator_errors_total").increment(1);
            }
        }
    }

    // Stage 3: suggested publishers.
    let suggest = {
        let Some(strong) = inner.upgrade() else { return };
        let state = strong.state.lock().expect(POISONED);
        if state.suggested_publisher_ids.is_empty() {
            Some(Arc::clone(&strong.suggestions))
        } else {
            debug!("suggestion cache warm, skipping fetch");
            None
        }
    };
    if let Some(suggestions) = suggest {
        let result = suggestions.suggested_publisher_ids().await;
        let Some(strong) = inner.upgrade() else { return };
        let mut state = strong.state.lock().expect(POISONED);
        match result {
            Ok(ids) => state.suggested_publisher_ids = ids,
            Err(e) => {
                warn!(error = ?e, "suggestions fetch failed");
                counter!("feed_collaborator_errors_total").increment(1);
            }
        }
    }

    // Stage 4: topics.
    let topics = {
        let Some(strong) = inner.upgrade() else { return };
        let state = strong.state.lock().expect(POISONED);
        if state.topics.is_empty() {
            Some((
                Arc::clone(&strong.topics_fetcher),
                strong.publishers.last_locale(),
            ))
        } else {
            debug!("topic cache warm, skipping fetch");
            None
        }
    };
    if let Some((fetcher, locale)) = topics {
        let result = fetcher.get_topics(&locale).await;
        let Some(strong) = inner.upgrade() else { return };
        let mut state = strong.state.lock().expect(POISONED);
        match result {
            Ok(topics) => {
                debug!(count = topics.len(), "fetched topics");
                state.topics = topics;
            }
            Err(e) => {
                warn!(error = ?e, "topics fetch failed");
                counter!("feed_collaborator_errors_total").increment(1);
            }
        }
    }

    finish_update_cycle(&inner);
}

/// Completion: refresh the fingerprint, resolve every waiter with a snapshot
/// of the finished state (the completion barrier), notify listeners, then
/// kick off the pending follow-up cycle if one queued up.
fn finish_update_cycle(inner: &Weak<BuilderInner>) {
    let Some(strong) = inner.upgrade() else { return };

    let publishers = strong.publishers.last_publishers();
    let channels = strong.publishers.channels_from_publishers(&publishers);
    let locale = strong.publishers.last_locale();

    let (snapshot, waiters, follow_up) = {
        let mut state = strong.state.lock().expect(POISONED);
        let (hash, subscribed_count) =
            feed_hash_and_subscribed_count(&channels, &publishers, &state.etags);
        state.hash = hash.clone();
        state.subscribed_count = subscribed_count;

        let snapshot = Arc::new(FeedSnapshot {
            locale,
            raw_feed_items: state.raw_feed_items.clone(),
            publishers,
            channels,
            signals: state.signals.clone(),
            suggested_publisher_ids: state.suggested_publisher_ids.clone(),
            topics: state.topics.clone(),
            hash,
            subscribed_count,
            tuning: strong.tuning.clone(),
        });

        let update = mem::replace(&mut state.update, UpdateState::Idle);
        let (waiters, follow_up) = match update {
            // A cycle finished that nobody started; nothing to resolve.
            UpdateState::Idle => (Vec::new(), false),
            UpdateState::Running(cycle) => (cycle.waiters, false),
            UpdateState::RunningQueued(cycle, pending) => {
                state.clear_for(&pending.settings);
                state.update = UpdateState::Running(pending);
                (cycle.waiters, true)
            }
        };
        (snapshot, waiters, follow_up)
    };

    for waiter in waiters {
        let _ = waiter.send(Arc::clone(&snapshot));
    }

    notify_listeners(&strong, &snapshot.hash);
    gauge!("feed_last_update_ts").set(Utc::now().timestamp() as f64);

    if follow_up {
        counter!("feed_update_cycles_total").increment(1);
        tokio::spawn(run_update_cycle(inner.clone()));
    }
}
