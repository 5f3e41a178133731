//! Search strategy engine
//!
//! Builds ordered query variants from a track descriptor at
//! increasing normalization aggressiveness, and runs them strictly
//! sequentially until one yields usable audio results.

use anyhow::Result;
use std::future::Future;
use tracing::{debug, warn};

use crate::search::session::{base_name, SearchHit};

/// File extensions accepted as audio results
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "m4a", "aac", "wav", "ape", "wma", "aiff", "alac",
];

/// Whether a remote path names a recognized audio file
pub fn is_audio_file(path: &str) -> bool {
    let name = base_name(path);
    match name.rsplit_once('.') {
        Some((_, ext)) => AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

/// What the caller is looking for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackQuery {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
}

impl TrackQuery {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
            album: None,
        }
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }
}

/// Lowercase, strip punctuation to spaces, collapse whitespace
pub fn normalize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_space = true;
    for c in value.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Cut a featuring-artist clause: "song (feat. X)", "song ft. X"
fn strip_featuring(value: &str) -> String {
    let lower = value.to_lowercase();
    let markers = ["(feat", "[feat", " feat.", " feat ", " ft.", " ft ", "(with ", " featuring "];
    let cut = markers
        .iter()
        .filter_map(|m| lower.find(m))
        .min()
        .unwrap_or(value.len());
    value[..cut].trim().to_string()
}

/// Cut trailing qualifiers: "(live)", "(remastered 2011)", "- remix",
/// and classical movement/opus numbering ("op. 27 no. 2", "ii. allegro")
fn strip_qualifiers(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut depth = 0usize;
    for c in value.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }

    let lower = out.to_lowercase();
    let qualifier_markers = [
        " - live", " - remix", " - remaster", " - remastered", " - mono", " - stereo",
        " - single version", " - radio edit", " op.", " op ", " no.", " no ", " bwv", " k.",
    ];
    let cut = qualifier_markers
        .iter()
        .filter_map(|m| lower.find(m))
        .min()
        .unwrap_or(out.len());
    out[..cut].trim().to_string()
}

/// Build the ordered query variants for a track, most faithful first.
/// Duplicates and empty variants are dropped.
pub fn build_queries(query: &TrackQuery) -> Vec<String> {
    let mut variants = Vec::new();

    let artist = normalize(&query.artist);
    let title = normalize(&query.title);

    // Verbatim artist + title
    variants.push(format!("{} {}", artist, title));

    // Featuring clause stripped from the title
    let no_feat = normalize(&strip_featuring(&query.title));
    variants.push(format!("{} {}", artist, no_feat));

    // Aggressive: live/remix/remaster qualifiers and classical
    // movement/opus numbering stripped too
    let aggressive = normalize(&strip_qualifiers(&strip_featuring(&query.title)));
    variants.push(format!("{} {}", artist, aggressive));

    // Artist + album
    if let Some(album) = &query.album {
        variants.push(format!("{} {}", artist, normalize(album)));
    }

    // Title alone
    variants.push(title);

    let mut seen = std::collections::HashSet::new();
    variants
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Run the strategies in priority order against `search`, stopping at
/// the first variant whose results include a recognized audio file.
/// Per-strategy failures are non-fatal; an exhausted list yields an
/// empty result, which the caller counts toward its reconnect
/// threshold.
pub async fn run_strategies<F, Fut>(query: &TrackQuery, mut search: F) -> Result<Vec<SearchHit>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Vec<SearchHit>>>,
{
    for variant in build_queries(query) {
        debug!("Trying search variant: {:?}", variant);
        match search(variant.clone()).await {
            Ok(hits) => {
                if hits.iter().any(|hit| is_audio_file(&hit.filename)) {
                    debug!("Variant {:?} yielded {} hits", variant, hits.len());
                    return Ok(hits);
                }
                debug!("Variant {:?} yielded no audio results", variant);
            }
            Err(e) => {
                warn!("Search variant {:?} failed: {}", variant, e);
            }
        }
    }

    Ok(Vec::new())
}
