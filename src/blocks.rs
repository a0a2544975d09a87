//! # Block & Cluster Generators
//! Assemble the typed units a feed is composed of: standard blocks (hero
//! plus a short run of inline cards), channel/topic clusters, adverts and
//! discover cards. Generators consume articles from the working set as they
//! pick them; an empty result always means "out of material", never an error.

use chrono::Utc;
use rand::Rng;
use tracing::debug;

use crate::config::{FeedTuning, TOP_NEWS_CHANNEL};
use crate::info::FeedGenerationInfo;
use crate::pick::{
    discovery_weighting, group_weighting, hero_weighting, normal_in_range, pick_random,
    pick_roulette_with_weighting, sample_content_group, toss_coin, ArticleInfo,
};
use crate::types::{
    Article, ArticleElement, ClusterKind, ContentGroup, FeedItem, Publishers, TopicArticle,
};
use crate::weight::ArticleWeight;

/// How many publisher suggestions one discover card carries at most.
const SUGGESTIONS_PER_DISCOVER: usize = 3;

/// Blocks between special cards in a basic feed.
const BLOCKS_PER_SPECIAL: usize = 2;

/// A picker selects an index into the candidate list, or `None` when no
/// candidate is eligible.
pub type Picker<'a, R> = dyn FnMut(&mut R, &[ArticleInfo]) -> Option<usize> + 'a;

/// Run a picker and remove the chosen article from the working set. Removal
/// is the dedup mechanism: a picked article can never be picked again.
fn pick_and_remove<R: Rng>(
    rng: &mut R,
    articles: &mut Vec<ArticleInfo>,
    picker: &mut Picker<'_, R>,
) -> Option<Article> {
    let index = picker(rng, articles)?;
    let (article, _weight) = articles.remove(index);
    Some(article)
}

/// Generate a standard block: one hero plus a normally distributed number of
/// inline cards. Returns an empty block when no hero can be picked; an
/// inline pick that fails is skipped, not retried.
pub fn generate_block<R: Rng>(
    rng: &mut R,
    articles: &mut Vec<ArticleInfo>,
    pick_hero: &mut Picker<'_, R>,
    pick_article: &mut Picker<'_, R>,
    tuning: &FeedTuning,
) -> Vec<FeedItem> {
    if articles.is_empty() {
        return Vec::new();
    }

    let Some(hero) = pick_and_remove(rng, articles, pick_hero) else {
        debug!("no hero candidate, skipping block");
        return Vec::new();
    };

    let mut result = vec![FeedItem::Hero(hero)];
    let inline_count = normal_in_range(rng, tuning.min_block_cards, tuning.max_block_cards + 1);
    for _ in 0..inline_count {
        match pick_and_remove(rng, articles, pick_article) {
            Some(article) => result.push(FeedItem::Inline(article)),
            None => debug!("no eligible inline article"),
        }
    }

    result
}

/// Standard block where both pickers roulette over one weighting; the hero
/// pick additionally requires an image.
pub fn generate_block_with_weighting<R, W>(
    rng: &mut R,
    articles: &mut Vec<ArticleInfo>,
    weighting: W,
    tuning: &FeedTuning,
) -> Vec<FeedItem>
where
    R: Rng,
    W: Fn(&Article, &ArticleWeight) -> f64,
{
    let mut pick_hero = |rng: &mut R, candidates: &[ArticleInfo]| {
        pick_roulette_with_weighting(rng, candidates, hero_weighting(&weighting))
    };
    let mut pick_article = |rng: &mut R, candidates: &[ArticleInfo]| {
        pick_roulette_with_weighting(rng, candidates, &weighting)
    };
    generate_block(rng, articles, &mut pick_hero, &mut pick_article, tuning)
}

/// Picker targeting a freshly sampled content group on every pick. With
/// probability `discovery_ratio` a pick uses discovery weighting instead.
fn group_targeted_picker<R: Rng>(
    eligible: Vec<ContentGroup>,
    discovery_ratio: f64,
    hero: bool,
) -> impl FnMut(&mut R, &[ArticleInfo]) -> Option<usize> {
    move |rng, articles| {
        let weighting: Box<dyn Fn(&Article, &ArticleWeight) -> f64> =
            if discovery_ratio > rng.random::<f64>() {
                Box::new(discovery_weighting)
            } else {
                match sample_content_group(rng, &eligible) {
                    Some(group) => Box::new(group_weighting(group)),
                    None => Box::new(|_, _| 0.0),
                }
            };

        if hero {
            pick_roulette_with_weighting(rng, articles, hero_weighting(weighting))
        } else {
            pick_roulette_with_weighting(rng, articles, weighting)
        }
    }
}

/// Standard block aimed at the user's subscribed content groups. The hero is
/// always group-targeted (discovery ratio 0); inline cards use the configured
/// discovery ratio.
pub fn generate_block_from_content_groups<R: Rng>(
    rng: &mut R,
    info: &mut FeedGenerationInfo,
) -> Vec<FeedItem> {
    if info.articles().is_empty() || info.content_groups().is_empty() {
        return Vec::new();
    }

    let eligible = info.content_groups().to_vec();
    let tuning = info.tuning().clone();

    let mut pick_hero = group_targeted_picker(eligible.clone(), 0.0, true);
    let mut pick_article =
        group_targeted_picker(eligible, tuning.inline_discovery_ratio, false);

    generate_block(
        rng,
        info.articles_mut(),
        &mut pick_hero,
        &mut pick_article,
        &tuning,
    )
}

fn into_cluster(kind: ClusterKind, id: String, block: Vec<FeedItem>) -> Vec<FeedItem> {
    let articles = block
        .into_iter()
        .filter_map(|item| match item {
            FeedItem::Hero(a) => Some(ArticleElement::Hero(a)),
            FeedItem::Inline(a) => Some(ArticleElement::Inline(a)),
            _ => None,
        })
        .collect();
    vec![FeedItem::Cluster { kind, id, articles }]
}

/// A standard block restricted to one channel, wrapped as a cluster. Yields
/// nothing (rather than a partial cluster) when the channel has no material.
pub fn generate_channel_block<R: Rng>(
    rng: &mut R,
    info: &mut FeedGenerationInfo,
    channel: &str,
) -> Vec<FeedItem> {
    debug!(channel, "channel block");
    let tuning = info.tuning().clone();
    let block = generate_block_with_weighting(
        rng,
        info.articles_mut(),
        group_weighting(ContentGroup::channel(channel)),
        &tuning,
    );

    if block.is_empty() {
        return Vec::new();
    }
    into_cluster(ClusterKind::Channel, channel.to_string(), block)
}

/// Synthesize an [`Article`] from a topic entry, resolving the publisher id
/// by name where possible.
fn from_topic_article(publishers: &Publishers, article: &TopicArticle) -> Article {
    let publisher_id = publishers
        .values()
        .find(|p| p.name == article.publisher_name)
        .map(|p| p.id.clone())
        .unwrap_or_default();

    Article {
        publisher_id,
        publisher_name: article.publisher_name.clone(),
        category: article.category.clone(),
        title: article.title.clone(),
        description: article.description.clone().unwrap_or_default(),
        url: article.url.clone(),
        image: article.image.clone(),
        publish_time: Utc::now(),
        pop_score: 0.0,
    }
}

/// The "Top News" opener: the leading article of each of the current topics,
/// capped at one block's width, wrapped as a topic cluster.
pub fn generate_top_topics_block(info: &FeedGenerationInfo) -> Vec<FeedItem> {
    let max_block_size = info.tuning().max_block_cards as usize;
    let mut items = Vec::new();

    for topic in info.topics() {
        let Some(article) = topic.articles.first() else {
            continue;
        };
        items.push(ArticleElement::Inline(from_topic_article(
            info.publishers(),
            article,
        )));
        if items.len() >= max_block_size {
            break;
        }
    }

    if items.is_empty() {
        return Vec::new();
    }
    vec![FeedItem::Cluster {
        kind: ClusterKind::Topic,
        id: TOP_NEWS_CHANNEL.to_string(),
        articles: items,
    }]
}

/// A cluster from the front topic, which is consumed so it is never shown
/// twice within one feed.
pub fn generate_topic_block(info: &mut FeedGenerationInfo) -> Vec<FeedItem> {
    let max_articles = info.tuning().max_block_cards as usize;
    let Some(topic) = info.pop_topic() else {
        return Vec::new();
    };
    debug!(topic = %topic.title, "topic block");

    let articles = topic
        .articles
        .iter()
        .take(max_articles)
        .map(|a| ArticleElement::Inline(from_topic_article(info.publishers(), a)))
        .collect();

    vec![FeedItem::Cluster {
        kind: ClusterKind::Topic,
        id: topic.title,
        articles,
    }]
}

/// Either a channel cluster or a topic cluster, decided by the configured
/// ratio. Topic clusters are only considered while unshown topics remain.
pub fn generate_cluster_block<R: Rng>(
    rng: &mut R,
    info: &mut FeedGenerationInfo,
) -> Vec<FeedItem> {
    if info.channels().is_empty() && info.topics().is_empty() {
        debug!("no subscribed channels or unshown topics");
        return Vec::new();
    }

    let generate_channel = (!info.channels().is_empty()
        && rng.random::<f64>() < info.tuning().category_topic_ratio)
        || info.topics().is_empty();

    if generate_channel {
        let channel = pick_random(rng, info.channels()).clone();
        generate_channel_block(rng, info, &channel)
    } else {
        generate_topic_block(info)
    }
}

pub fn generate_ad() -> Vec<FeedItem> {
    vec![FeedItem::Advert]
}

/// A special block: an advert half the time, otherwise up to three publisher
/// suggestions consumed from the discover queue, or nothing when the queue
/// is exhausted.
pub fn generate_special_block<R: Rng>(
    rng: &mut R,
    info: &mut FeedGenerationInfo,
) -> Vec<FeedItem> {
    // TODO(feed-ads): replace the coin toss with real ad availability once an
    // ad source is wired in.
    if toss_coin(rng) {
        return generate_ad();
    }

    let suggestions = info.take_suggestions(SUGGESTIONS_PER_DISCOVER);
    if suggestions.is_empty() {
        return Vec::new();
    }
    debug!(count = suggestions.len(), "discover card");
    vec![FeedItem::Discover(suggestions)]
}

/// The simple feed shape used for following/channel/publisher feeds: standard
/// blocks until exhaustion, a special card after every second block, and an
/// advert forced in as the second item of any feed longer than one item.
pub fn generate_basic_feed<R: Rng>(
    rng: &mut R,
    info: &mut FeedGenerationInfo,
    pick_hero: &mut Picker<'_, R>,
    pick_article: &mut Picker<'_, R>,
) -> Vec<FeedItem> {
    let tuning = info.tuning().clone();
    let mut feed_items = Vec::new();

    let mut blocks = 0usize;
    while !info.articles().is_empty() {
        let mut items = generate_block(rng, info.articles_mut(), pick_hero, pick_article, &tuning);
        if items.is_empty() {
            break;
        }

        if blocks % BLOCKS_PER_SPECIAL == 0 && blocks != 0 {
            items.extend(generate_special_block(rng, info));
        }

        feed_items.extend(items);
        blocks += 1;
    }

    if feed_items.len() > 1 {
        feed_items.insert(1, FeedItem::Advert);
    }

    feed_items
}

/// The full "For You" feed: a fixed opener (standard block, advert, top-news
/// cluster) followed by a repeating three-phase cycle. Only a failed phase-one
/// standard block terminates the cycle; empty cluster or special phases do
/// not.
pub fn generate_all_feed<R: Rng>(rng: &mut R, info: &mut FeedGenerationInfo) -> Vec<FeedItem> {
    let mut feed_items = Vec::new();

    // Nothing subscribed, or nothing fetched: no feed to build.
    if info.content_groups().is_empty() || info.articles().is_empty() {
        return feed_items;
    }

    // Opening sequence: standard block, a guaranteed advert, then top news.
    let initial = generate_block_from_content_groups(rng, info);
    debug!(articles = initial.len(), "opening standard block");
    feed_items.extend(initial);

    feed_items.extend(generate_ad());

    let mut top_news = generate_top_topics_block(info);
    if top_news.is_empty() {
        top_news = generate_channel_block(rng, info, TOP_NEWS_CHANNEL);
    }
    feed_items.extend(top_news);

    const ITERATION_TYPES: u32 = 3;
    let mut iteration = 0u32;
    loop {
        let iteration_type = iteration % ITERATION_TYPES;
        let items = match iteration_type {
            0 => generate_block_from_content_groups(rng, info),
            1 => {
                if toss_coin(rng) {
                    generate_block_from_content_groups(rng, info)
                } else {
                    generate_cluster_block(rng, info)
                }
            }
            _ => {
                if toss_coin(rng) {
                    generate_special_block(rng, info)
                } else {
                    Vec::new()
                }
            }
        };

        // Out of standard-block material: the feed is complete.
        if iteration_type == 0 && items.is_empty() {
            break;
        }

        debug!(
            added = items.len(),
            iteration_type,
            total = feed_items.len(),
            "feed cycle step"
        );
        feed_items.extend(items);
        iteration += 1;
    }

    feed_items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedTuning;
    use crate::pick::subscribed_weighting;
    use crate::types::{Channel, Channels, LocaleInfo, Publisher, Signal, Signals, Topic, UserEnabled};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::{HashMap, HashSet};

    fn publisher(id: &str, channels: &[&str]) -> Publisher {
        Publisher {
            id: id.into(),
            name: id.to_uppercase(),
            user_enabled: UserEnabled::Enabled,
            locales: vec![LocaleInfo {
                locale: "en_US".into(),
                channels: channels.iter().map(|c| c.to_string()).collect(),
            }],
        }
    }

    fn article(url: &str, publisher_id: &str, image: bool) -> Article {
        Article {
            publisher_id: publisher_id.into(),
            publisher_name: publisher_id.to_uppercase(),
            category: "Tech".into(),
            title: format!("title {url}"),
            description: String::new(),
            url: url.into(),
            image: image.then(|| format!("{url}/image.jpg")),
            publish_time: Utc::now(),
            pop_score: 10.0,
        }
    }

    fn subscribed_signal() -> Signal {
        Signal {
            subscribed_weight: 10.0,
            visit_weight: 0.0,
            article_count: 10,
            disabled: false,
        }
    }

    /// An info with one subscribed publisher and `count` of its articles.
    fn simple_info(count: usize, with_images: bool) -> FeedGenerationInfo {
        let publishers = HashMap::from([("p1".to_string(), publisher("p1", &["Tech"]))]);
        let channels: Channels = HashMap::from([(
            "Tech".to_string(),
            Channel {
                name: "Tech".into(),
                subscribed_locales: vec!["en_US".into()],
            },
        )]);
        let signals: Signals = HashMap::from([
            ("p1".to_string(), subscribed_signal()),
            ("Tech".to_string(), subscribed_signal()),
        ]);
        let items: Vec<Article> = (0..count)
            .map(|i| article(&format!("https://a.example/{i}"), "p1", with_images))
            .collect();

        FeedGenerationInfo::new(
            "en_US".into(),
            &items,
            publishers,
            &channels,
            &signals,
            vec![],
            vec![],
            FeedTuning::default(),
        )
    }

    #[test]
    fn block_without_image_bearing_articles_is_empty() {
        let mut info = simple_info(10, false);
        let mut rng = StdRng::seed_from_u64(17);
        let tuning = info.tuning().clone();
        let block = generate_block_with_weighting(
            &mut rng,
            info.articles_mut(),
            subscribed_weighting,
            &tuning,
        );
        assert!(block.is_empty());
        // Nothing was consumed either.
        assert_eq!(info.articles().len(), 10);
    }

    #[test]
    fn block_starts_with_a_hero_and_respects_card_bounds() {
        let mut info = simple_info(50, true);
        let mut rng = StdRng::seed_from_u64(5);
        let tuning = info.tuning().clone();
        let block = generate_block_with_weighting(
            &mut rng,
            info.articles_mut(),
            subscribed_weighting,
            &tuning,
        );
        assert!(matches!(block[0], FeedItem::Hero(_)));
        let inline = block.len() - 1;
        assert!(inline >= tuning.min_block_cards as usize);
        assert!(inline <= tuning.max_block_cards as usize);
    }

    #[test]
    fn channel_block_for_unknown_channel_is_empty() {
        let mut info = simple_info(20, true);
        let mut rng = StdRng::seed_from_u64(9);
        let block = generate_channel_block(&mut rng, &mut info, "Gardening");
        assert!(block.is_empty());
    }

    #[test]
    fn channel_block_wraps_into_a_single_cluster() {
        let mut info = simple_info(20, true);
        let mut rng = StdRng::seed_from_u64(9);
        let block = generate_channel_block(&mut rng, &mut info, "Tech");
        assert_eq!(block.len(), 1);
        match &block[0] {
            FeedItem::Cluster { kind, id, articles } => {
                assert_eq!(*kind, ClusterKind::Channel);
                assert_eq!(id, "Tech");
                assert!(!articles.is_empty());
            }
            other => panic!("expected cluster, got {other:?}"),
        }
    }

    fn topic(title: &str, urls: &[&str]) -> Topic {
        Topic {
            title: title.into(),
            articles: urls
                .iter()
                .map(|u| TopicArticle {
                    publisher_name: "P1".into(),
                    category: "Tech".into(),
                    title: format!("topic {u}"),
                    description: None,
                    url: u.to_string(),
                    image: None,
                })
                .collect(),
        }
    }

    #[test]
    fn topic_block_consumes_the_front_topic() {
        let publishers = HashMap::from([("p1".to_string(), publisher("p1", &[]))]);
        let mut info = FeedGenerationInfo::new(
            "en_US".into(),
            &[],
            publishers,
            &HashMap::new(),
            &HashMap::new(),
            vec![],
            vec![
                topic("First", &["https://t.example/1"]),
                topic("Second", &["https://t.example/2"]),
            ],
            FeedTuning::default(),
        );

        let block = generate_topic_block(&mut info);
        match &block[0] {
            FeedItem::Cluster { kind, id, .. } => {
                assert_eq!(*kind, ClusterKind::Topic);
                assert_eq!(id, "First");
            }
            other => panic!("expected cluster, got {other:?}"),
        }
        assert_eq!(info.topics().len(), 1);

        let block = generate_topic_block(&mut info);
        match &block[0] {
            FeedItem::Cluster { id, .. } => assert_eq!(id, "Second"),
            other => panic!("expected cluster, got {other:?}"),
        }
        assert!(generate_topic_block(&mut info).is_empty());
    }

    #[test]
    fn top_topics_block_takes_one_leading_article_per_topic() {
        let publishers = HashMap::from([("p1".to_string(), publisher("p1", &[]))]);
        let info = FeedGenerationInfo::new(
            "en_US".into(),
            &[],
            publishers,
            &HashMap::new(),
            &HashMap::new(),
            vec![],
            vec![
                topic("A", &["https://t.example/a1", "https://t.example/a2"]),
                topic("B", &["https://t.example/b1"]),
                topic("Empty", &[]),
            ],
            FeedTuning::default(),
        );

        let block = generate_top_topics_block(&info);
        match &block[0] {
            FeedItem::Cluster { kind, id, articles } => {
                assert_eq!(*kind, ClusterKind::Topic);
                assert_eq!(id, TOP_NEWS_CHANNEL);
                assert_eq!(articles.len(), 2);
            }
            other => panic!("expected cluster, got {other:?}"),
        }
    }

    #[test]
    fn cluster_block_with_no_channels_or_topics_yields_nothing() {
        let mut info = FeedGenerationInfo::new(
            "en_US".into(),
            &[],
            HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            vec![],
            vec![],
            FeedTuning::default(),
        );
        let mut rng = StdRng::seed_from_u64(1);
        assert!(generate_cluster_block(&mut rng, &mut info).is_empty());
    }

    #[test]
    fn special_block_discover_consumes_the_suggestion_queue() {
        let mut info = FeedGenerationInfo::new(
            "en_US".into(),
            &[],
            HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            vec!["s1".into(), "s2".into(), "s3".into(), "s4".into()],
            vec![],
            FeedTuning::default(),
        );
        let mut rng = StdRng::seed_from_u64(2);
        let mut discovered: Vec<String> = Vec::new();
        for _ in 0..64 {
            for item in generate_special_block(&mut rng, &mut info) {
                if let FeedItem::Discover(ids) = item {
                    discovered.extend(ids);
                }
            }
        }
        // Each suggestion shows up exactly once across the whole run.
        assert_eq!(discovered, vec!["s1", "s2", "s3", "s4"]);
        assert_eq!(info.suggestions_remaining(), 0);
    }

    #[test]
    fn all_feed_with_no_subscriptions_is_empty() {
        let mut info = FeedGenerationInfo::new(
            "en_US".into(),
            &[],
            HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            vec![],
            vec![],
            FeedTuning::default(),
        );
        let mut rng = StdRng::seed_from_u64(3);
        assert!(generate_all_feed(&mut rng, &mut info).is_empty());
    }

    fn collect_urls(items: &[FeedItem], urls: &mut Vec<String>) {
        for item in items {
            match item {
                FeedItem::Hero(a) | FeedItem::Inline(a) => urls.push(a.url.clone()),
                FeedItem::Cluster { articles, .. } => {
                    for el in articles {
                        match el {
                            ArticleElement::Hero(a) | ArticleElement::Inline(a) => {
                                urls.push(a.url.clone())
                            }
                        }
                    }
                }
                FeedItem::Advert | FeedItem::Discover(_) => {}
            }
        }
    }

    #[test]
    fn all_feed_never_repeats_an_article() {
        for seed in [1u64, 2, 3, 4, 5] {
            let mut info = simple_info(80, true);
            let mut rng = StdRng::seed_from_u64(seed);
            let items = generate_all_feed(&mut rng, &mut info);
            assert!(!items.is_empty());

            let mut urls = Vec::new();
            collect_urls(&items, &mut urls);
            let unique: HashSet<&String> = urls.iter().collect();
            assert_eq!(unique.len(), urls.len(), "duplicate article in feed");
        }
    }

    #[test]
    fn basic_feed_places_an_ad_second_when_long_enough() {
        for seed in [7u64, 11, 13] {
            let mut info = simple_info(40, true);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut pick_hero = |rng: &mut StdRng, c: &[ArticleInfo]| {
                pick_roulette_with_weighting(rng, c, subscribed_weighting)
            };
            let mut pick_article = |rng: &mut StdRng, c: &[ArticleInfo]| {
                pick_roulette_with_weighting(rng, c, subscribed_weighting)
            };
            let items =
                generate_basic_feed(&mut rng, &mut info, &mut pick_hero, &mut pick_article);
            assert!(items.len() > 1);
            assert_eq!(items[1], FeedItem::Advert);
        }
    }

    #[test]
    fn basic_feed_on_empty_working_set_is_empty() {
        let mut info = simple_info(0, true);
        let mut rng = StdRng::seed_from_u64(1);
        let mut pick_hero = |rng: &mut StdRng, c: &[ArticleInfo]| {
            pick_roulette_with_weighting(rng, c, subscribed_weighting)
        };
        let mut pick_article = |rng: &mut StdRng, c: &[ArticleInfo]| {
            pick_roulette_with_weighting(rng, c, subscribed_weighting)
        };
        let items = generate_basic_feed(&mut rng, &mut info, &mut pick_hero, &mut pick_article);
        assert!(items.is_empty());
    }
}
