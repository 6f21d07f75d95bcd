use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

use crate::domain::episodes::CandidatePool;
use crate::domain::models::{EpisodeCandidate, MatchResult, TimeWindow};
use crate::ocr::RecognizedText;

/// Tunable weights of the confidence formula.
///
/// Each kind of evidence is scaled by its weight and the two are combined as
/// independent signals: `1 - (1 - w_n * numeral) * (1 - w_t * title)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchWeights {
    pub numeral: f64,
    pub title: f64,
    /// Credit for a numeral that agrees on the episode number only
    pub partial_numeral: f64,
    /// Title similarity below this counts as no title evidence
    pub min_title_similarity: f64,
    /// Best scores at or below this floor produce no match
    pub floor: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            numeral: 0.9,
            title: 0.8,
            partial_numeral: 0.5,
            min_title_similarity: 0.6,
            floor: 0.05,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TextMatcher {
    weights: MatchWeights,
}

/// Season/episode numbers read off the recognized text.
#[derive(Debug, Default, PartialEq)]
struct Numerals {
    pairs: Vec<(u64, u64)>,
    episodes: Vec<u64>,
}

impl TextMatcher {
    pub fn new(weights: MatchWeights) -> Self {
        Self { weights }
    }

    /// Scores `text` against every candidate in `pool` and returns the best
    /// one. Garbled or empty input degrades to a result with no candidate.
    pub fn match_text(
        &self,
        text: &RecognizedText,
        pool: &CandidatePool,
        window: TimeWindow,
    ) -> MatchResult {
        let spans: Vec<String> = text
            .spans
            .iter()
            .map(|s| normalize(&s.text))
            .filter(|s| !s.is_empty())
            .collect();
        if spans.is_empty() {
            return MatchResult::none(window);
        }
        let joined = spans.join(" ");
        let numerals = find_numerals(&joined);

        let mut best: Option<(&EpisodeCandidate, f64)> = None;
        let mut tied = false;
        for (candidate, allowed) in pool.iter() {
            if !allowed {
                continue;
            }
            let score = self.score(candidate, &spans, &joined, &numerals);
            match best {
                Some((_, top)) if (score - top).abs() < 1e-9 => tied = true,
                Some((_, top)) if score < top => {}
                _ => {
                    best = Some((candidate, score));
                    tied = false;
                }
            }
        }

        match best {
            Some((candidate, score)) if score > self.weights.floor && !tied => MatchResult {
                candidate: Some(candidate.clone()),
                confidence: score,
                window,
            },
            Some((candidate, score)) if score > self.weights.floor => {
                debug!(window = %window, score, candidate = %candidate, "Ambiguous match, ignoring");
                MatchResult::none(window)
            }
            _ => MatchResult::none(window),
        }
    }

    fn score(
        &self,
        candidate: &EpisodeCandidate,
        spans: &[String],
        joined: &str,
        numerals: &Numerals,
    ) -> f64 {
        let numeral = if numerals.pairs.contains(&candidate.key()) {
            1.0
        } else if numerals.episodes.contains(&candidate.episode)
            || numerals.pairs.iter().any(|(_, e)| *e == candidate.episode)
        {
            self.weights.partial_numeral
        } else {
            0.0
        };

        let similarity = title_similarity(&normalize(&candidate.title), spans, joined);
        let title = if similarity >= self.weights.min_title_similarity {
            similarity
        } else {
            0.0
        };

        1.0 - (1.0 - self.weights.numeral * numeral) * (1.0 - self.weights.title * title)
    }
}

/// Lowercases, maps punctuation to spaces and collapses whitespace runs.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// OCR commonly reads 0 as o and 1 as i or l
fn ocr_digits(value: &str) -> Option<u64> {
    let digits: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            'o' => '0',
            'i' | 'l' => '1',
            c => c,
        })
        .collect();
    digits.parse().ok()
}

fn pair_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"s ?([0-9oil]{1,3}(?: ?[0-9oil]{1,2})?) ?e ?([0-9]{1,3})(?:[^0-9]|$)")
            .expect("static pattern is valid")
    })
}

fn cross_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|[^0-9a-z])([0-9]{1,2})x([0-9]{2,3})(?:[^0-9]|$)")
            .expect("static pattern is valid")
    })
}

fn episode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|[^0-9a-z])(?:episode|ep|e) ?([0-9]{1,3})(?:[^0-9]|$)")
            .expect("static pattern is valid")
    })
}

fn find_numerals(text: &str) -> Numerals {
    let mut numerals = Numerals::default();
    for caps in pair_pattern().captures_iter(text) {
        if let (Some(season), Some(episode)) = (ocr_digits(&caps[1]), ocr_digits(&caps[2])) {
            numerals.pairs.push((season, episode));
        }
    }
    for caps in cross_pattern().captures_iter(text) {
        if let (Ok(season), Ok(episode)) = (caps[1].parse(), caps[2].parse()) {
            numerals.pairs.push((season, episode));
        }
    }
    for caps in episode_pattern().captures_iter(text) {
        if let Ok(episode) = caps[1].parse() {
            numerals.episodes.push(episode);
        }
    }
    numerals
}

/// Similarity in [0, 1] between a normalized title and the recognized text:
/// 1.0 when the title appears verbatim, otherwise the best normalized edit
/// similarity against any span or any run of words as long as the title.
fn title_similarity(title: &str, spans: &[String], joined: &str) -> f64 {
    if title.is_empty() {
        return 0.0;
    }
    if format!(" {joined} ").contains(&format!(" {title} ")) {
        return 1.0;
    }
    // Edit distance is meaningless on very short titles
    if title.chars().count() < 4 {
        return 0.0;
    }

    let title_words = title.split(' ').count();
    let words: Vec<&str> = joined.split(' ').collect();
    let runs = words
        .windows(title_words.min(words.len()))
        .map(|run| run.join(" "));

    spans
        .iter()
        .cloned()
        .chain(runs)
        .map(|candidate| strsim::normalized_levenshtein(&candidate, title))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::episodes::{EpisodeList, Subset};

    const WINDOW: TimeWindow = TimeWindow::new(4, 6);

    fn pool(subset: Option<&Subset>) -> CandidatePool {
        CandidatePool::new(
            EpisodeList::new(vec![
                EpisodeCandidate::new(1, 1, "Welcome Home"),
                EpisodeCandidate::new(1, 2, "The Long Night"),
                EpisodeCandidate::new(1, 3, "Pilot"),
                EpisodeCandidate::new(2, 3, "Crossroads"),
            ]),
            subset,
        )
        .unwrap()
    }

    fn text(spans: &[&str]) -> RecognizedText {
        RecognizedText::from_strings(spans.iter().copied())
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  S01E03 -- Pilot!! "), "s01e03 pilot");
        assert_eq!(normalize("THE\tLONG\n\nNIGHT"), "the long night");
        assert_eq!(normalize("?!"), "");
    }

    #[test]
    fn test_clean_text_matches() {
        let matcher = TextMatcher::default();
        let result = matcher.match_text(&text(&["S01E03 Pilot"]), &pool(None), WINDOW);
        assert_eq!(result.candidate, Some(EpisodeCandidate::new(1, 3, "Pilot")));
        assert!(result.confidence > 0.5);
        assert_eq!(result.window, WINDOW);
    }

    #[test]
    fn test_garbled_text_matches_with_lower_confidence() {
        let matcher = TextMatcher::default();
        let clean = matcher.match_text(&text(&["S01E03 Pilot"]), &pool(None), WINDOW);
        let garbled = matcher.match_text(&text(&["S0 1lE03 Pi1ot"]), &pool(None), WINDOW);

        assert_eq!(garbled.candidate, Some(EpisodeCandidate::new(1, 3, "Pilot")));
        assert!(garbled.confidence > 0.5);
        assert!(garbled.confidence < clean.confidence);
    }

    #[test]
    fn test_unrelated_text_has_no_match() {
        let matcher = TextMatcher::default();
        let result = matcher.match_text(
            &text(&["Executive Producer", "Jane Doe", "Copyright 2004"]),
            &pool(None),
            WINDOW,
        );
        assert_eq!(result.candidate, None);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_empty_and_garbage_input() {
        let matcher = TextMatcher::default();
        assert_eq!(
            matcher.match_text(&RecognizedText::default(), &pool(None), WINDOW),
            MatchResult::none(WINDOW)
        );
        let garbage = matcher.match_text(&text(&["~~~", "|||", "#%&*"]), &pool(None), WINDOW);
        assert_eq!(garbage.candidate, None);
    }

    #[test]
    fn test_title_only_match() {
        let matcher = TextMatcher::default();
        let result = matcher.match_text(&text(&["THE LONG NIGHT"]), &pool(None), WINDOW);
        assert_eq!(result.candidate.map(|c| c.key()), Some((1, 2)));
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_title_found_inside_longer_text() {
        let matcher = TextMatcher::default();
        let result = matcher.match_text(
            &text(&["Tonight on", "the long night", "guest starring"]),
            &pool(None),
            WINDOW,
        );
        assert_eq!(result.candidate.map(|c| c.key()), Some((1, 2)));
    }

    #[test]
    fn test_numeral_only_match() {
        let matcher = TextMatcher::default();
        let result = matcher.match_text(&text(&["Season 2", "S2 E3"]), &pool(None), WINDOW);
        assert_eq!(result.candidate.map(|c| c.key()), Some((2, 3)));
        assert!((result.confidence - 0.9).abs() < 1e-9);

        let cross = matcher.match_text(&text(&["1x02"]), &pool(None), WINDOW);
        assert_eq!(cross.candidate.map(|c| c.key()), Some((1, 2)));
    }

    #[test]
    fn test_ambiguous_partial_numeral() {
        // "E3" alone fits both S01E03 and S02E03
        let matcher = TextMatcher::default();
        let result = matcher.match_text(&text(&["Episode 3"]), &pool(None), WINDOW);
        assert_eq!(result.candidate, None);
    }

    #[test]
    fn test_subset_excludes_candidates() {
        let matcher = TextMatcher::default();
        let subset = Subset::Season(2);
        let result = matcher.match_text(
            &text(&["S01E01 Welcome Home"]),
            &pool(Some(&subset)),
            WINDOW,
        );
        assert_eq!(result.candidate, None);

        let inside = matcher.match_text(&text(&["Crossroads"]), &pool(Some(&subset)), WINDOW);
        assert_eq!(inside.candidate.map(|c| c.key()), Some((2, 3)));
    }

    #[test]
    fn test_find_numerals() {
        assert_eq!(
            find_numerals("s01e03 pilot"),
            Numerals {
                pairs: vec![(1, 3)],
                episodes: vec![]
            }
        );
        assert_eq!(find_numerals("s0 1le03 pi1ot").pairs, vec![(11, 3)]);
        assert_eq!(find_numerals("season 1 episode 12").episodes, vec![12]);
        assert_eq!(find_numerals("3x07").pairs, vec![(3, 7)]);
        assert_eq!(find_numerals("lost in space"), Numerals::default());
    }

    #[test]
    fn test_title_similarity() {
        let spans = vec!["pi1ot".to_string()];
        let similarity = title_similarity("pilot", &spans, "pi1ot");
        assert!((similarity - 0.8).abs() < 1e-9);

        assert_eq!(title_similarity("pilot", &[], "the pilot returns"), 1.0);
        assert_eq!(title_similarity("up", &["us".to_string()], "us"), 0.0);
        assert_eq!(title_similarity("", &["x".to_string()], "x"), 0.0);
    }
}
