//! Change-detection fingerprint over subscription state. Folds subscribed
//! channel ids, enabled/disabled publisher ids and per-locale ETags through
//! SHA-256; not an integrity measure, purely a "should the client re-fetch"
//! marker.

use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::types::{Channels, Etags, Publishers, UserEnabled};

fn fold(hash: &str, item: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hash.as_bytes());
    hasher.update(item.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Compute the feed hash and the number of subscribed content groups
/// (channels with any subscribed locale plus enabled publishers).
pub fn feed_hash_and_subscribed_count(
    channels: &Channels,
    publishers: &Publishers,
    etags: &Etags,
) -> (String, usize) {
    let mut hash_items = Vec::new();
    let mut subscribed_count = 0usize;

    for (id, channel) in channels {
        if !channel.subscribed_locales.is_empty() {
            hash_items.push(id.clone());
            subscribed_count += 1;
        }
    }

    for (id, publisher) in publishers {
        if publisher.is_enabled() {
            hash_items.push(id.clone());
            subscribed_count += 1;
        }

        // Disabling a publisher changes what can be shown, so it must also
        // change the hash.
        if publisher.user_enabled == UserEnabled::Disabled {
            hash_items.push(format!("{id}_disabled"));
        }
    }

    for (region, etag) in etags {
        hash_items.push(format!("{region}{etag}"));
    }

    // Map iteration order is unspecified; sort for a stable fingerprint.
    hash_items.sort();

    let mut hash = String::new();
    for item in &hash_items {
        hash = fold(&hash, item);
    }

    (hash, subscribed_count)
}
