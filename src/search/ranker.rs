//! Result ranker
//!
//! Scores raw search hits against the desired (artist, title) via
//! weighted heuristics and returns a bounded, deterministically
//! ordered candidate list for the download retry loop.

use serde::Serialize;
use tracing::{debug, trace};

use crate::search::session::{base_name, SearchHit};
use crate::search::strategy::{is_audio_file, normalize, TrackQuery};

/// Lossless extensions, ranked above lossy regardless of bitrate
const LOSSLESS_EXTENSIONS: &[&str] = &["flac", "ape", "wav", "alac", "aiff"];

/// Lossy files at or above this bitrate count as high quality
const HIGH_BITRATE_KBPS: u32 = 256;

/// Speeds at or above this count as fast peers (bytes/sec)
const FAST_SPEED: u32 = 500_000;

/// Plausible size range for a single track
const MIN_TRACK_BYTES: u64 = 500_000;
const MAX_TRACK_BYTES: u64 = 120_000_000;

/// Scoring weights. The defaults encode the intended dominance order:
/// an exact artist+title match with a free slot beats any quality or
/// speed advantage alone.
#[derive(Debug, Clone)]
pub struct RankerWeights {
    pub free_slot: i32,
    pub fast_speed: i32,
    pub medium_speed: i32,
    pub exact_match: i32,
    pub partial_match: i32,
    pub lossless: i32,
    pub high_bitrate: i32,
    pub plausible_size: i32,
    /// Candidates scoring below this are discarded
    pub min_score: i32,
    /// Bound on the returned candidate list
    pub max_candidates: usize,
}

impl Default for RankerWeights {
    fn default() -> Self {
        Self {
            free_slot: 20,
            fast_speed: 10,
            medium_speed: 5,
            exact_match: 30,
            partial_match: 10,
            lossless: 15,
            high_bitrate: 10,
            plausible_size: 5,
            min_score: 20,
            max_candidates: 10,
        }
    }
}

/// A hit that survived filtering, with its score
#[derive(Debug, Clone, Serialize)]
pub struct RankedHit {
    pub hit: SearchHit,
    pub score: i32,
}

/// Rank raw hits for (artist, title). Duplicates by (username, bare
/// filename) collapse to the first occurrence; blocked peers are
/// filtered; survivors below the threshold are dropped; the rest sort
/// descending by score with deterministic tie-breaking.
pub fn rank<B>(hits: &[SearchHit], want: &TrackQuery, mut is_blocked: B, weights: &RankerWeights) -> Vec<RankedHit>
where
    B: FnMut(&str) -> bool,
{
    let artist = normalize(&want.artist);
    let title = normalize(&want.title);

    let mut seen = std::collections::HashSet::new();
    let mut ranked: Vec<RankedHit> = Vec::new();

    for hit in hits {
        if !seen.insert((hit.username.clone(), base_name(&hit.filename).to_string())) {
            continue;
        }
        if is_blocked(&hit.username) {
            trace!("Skipping blocked peer {}", hit.username);
            continue;
        }
        if !is_audio_file(&hit.filename) {
            continue;
        }

        let score = score_hit(hit, &artist, &title, weights);
        if score < weights.min_score {
            trace!("Discarding {} ({}): score {}", hit.filename, hit.username, score);
            continue;
        }
        ranked.push(RankedHit {
            hit: hit.clone(),
            score,
        });
    }

    ranked.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.hit.username.cmp(&b.hit.username))
            .then_with(|| a.hit.filename.cmp(&b.hit.filename))
    });
    ranked.truncate(weights.max_candidates);

    debug!("Ranked {} of {} hits", ranked.len(), hits.len());
    ranked
}

fn score_hit(hit: &SearchHit, artist: &str, title: &str, weights: &RankerWeights) -> i32 {
    let mut score = 0;

    if hit.slots_free {
        score += weights.free_slot;
    }

    if hit.avg_speed >= FAST_SPEED {
        score += weights.fast_speed;
    } else if hit.avg_speed >= FAST_SPEED / 5 {
        score += weights.medium_speed;
    }

    score += match_score(&normalize(&hit.filename), artist, title, weights);

    let extension = effective_extension(hit);
    if LOSSLESS_EXTENSIONS.contains(&extension.as_str()) {
        score += weights.lossless;
    } else if hit.bitrate.is_some_and(|kbps| kbps >= HIGH_BITRATE_KBPS) {
        score += weights.high_bitrate;
    }

    if (MIN_TRACK_BYTES..=MAX_TRACK_BYTES).contains(&hit.size) {
        score += weights.plausible_size;
    }

    score
}

/// Exact contiguous artist and title substrings beat partial word
/// overlap; partial credit needs at least half the title words.
fn match_score(filename: &str, artist: &str, title: &str, weights: &RankerWeights) -> i32 {
    if !artist.is_empty() && !title.is_empty() && filename.contains(artist) && filename.contains(title)
    {
        return weights.exact_match;
    }

    let title_words: Vec<&str> = title.split_whitespace().collect();
    if title_words.is_empty() {
        return 0;
    }
    let present = title_words
        .iter()
        .filter(|word| filename.split_whitespace().any(|w| w == **word))
        .count();
    if present * 2 >= title_words.len() {
        weights.partial_match
    } else {
        0
    }
}

/// Prefer the advertised extension; fall back to the filename's
fn effective_extension(hit: &SearchHit) -> String {
    if !hit.extension.is_empty() {
        return hit.extension.to_ascii_lowercase();
    }
    base_name(&hit.filename)
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}
