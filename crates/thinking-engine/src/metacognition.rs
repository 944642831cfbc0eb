//! Stateless lexical heuristics used by the mode engine (C7, §4.6).
//!
//! Everything here is "shallow" on purpose (§1 Non-goals): token overlap,
//! keyword weighting, hedge counting. None of it understands the content
//! of a thought, it only flags patterns worth surfacing to the client.

use std::collections::HashSet;

/// A single submitted thought, in submission order, as seen by the metacognition layer.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub thought_number: u64,
    pub text: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReasoningGap {
    pub issue: String,
    pub thought_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityBucket {
    Simple,
    Moderate,
    Complex,
}

const STOP_WORDS: &[&str] = &[
    "that", "this", "with", "from", "have", "which", "been", "were", "would",
    "could", "should", "their", "there", "about", "into", "than", "then",
    "they", "them", "when", "what", "will", "your", "also", "more",
];

const CONCLUSION_KEYWORDS: &[&str] = &["therefore", "thus", "conclude", "consequently", "hence"];
const EVIDENCE_MARKERS: &[&str] = &["because", "since", "given that", "due to", "based on", "as a result of"];
const HEDGE_WORDS: &[&str] = &["maybe", "perhaps", "might", "possibly", "not sure", "unclear", "i think", "probably"];

/// Lowercase, strip punctuation, drop tokens of length <= 3 and stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3 && !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Jaccard similarity over token sets. 0 for an empty union, 1 for identical
/// sets, 0 for disjoint sets.
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union_size = a.union(b).count();
    if union_size == 0 {
        return 0.0;
    }
    let intersection_size = a.intersection(b).count();
    intersection_size as f64 / union_size as f64
}

/// Similarity threshold above which two thoughts are considered to be
/// circling the same point instead of making progress.
const CIRCULARITY_THRESHOLD: f64 = 0.6;

/// Compare the most recent thought against each earlier window; warn if any
/// earlier window looks too similar to be genuine forward progress.
pub fn detect_circularity(history: &[HistoryEntry]) -> Option<String> {
    if history.len() < 3 {
        return None;
    }
    let recent = history.last().unwrap();
    let recent_tokens: HashSet<String> = tokenize(&recent.text).into_iter().collect();
    if recent_tokens.is_empty() {
        return None;
    }

    for earlier in &history[..history.len() - 1] {
        let earlier_tokens: HashSet<String> = tokenize(&earlier.text).into_iter().collect();
        let similarity = jaccard_similarity(&recent_tokens, &earlier_tokens);
        if similarity >= CIRCULARITY_THRESHOLD {
            return Some(format!(
                "thought {} closely echoes thought {} (similarity {:.2}); reasoning may be circling",
                recent.thought_number, earlier.thought_number, similarity
            ));
        }
    }
    None
}

/// Flag conclusions that arrive with too little preceding support.
pub fn analyze_reasoning_gaps(history: &[HistoryEntry]) -> Vec<ReasoningGap> {
    let mut gaps = Vec::new();
    for (i, entry) in history.iter().enumerate() {
        let lower = entry.text.to_lowercase();
        let is_conclusion = CONCLUSION_KEYWORDS.iter().any(|kw| lower.contains(kw));
        if !is_conclusion {
            continue;
        }
        if i < 2 {
            gaps.push(ReasoningGap {
                issue: "conclusion drawn with fewer than two prior thoughts".to_string(),
                thought_number: entry.thought_number,
            });
            continue;
        }
        let antecedent = history[i - 1].text.to_lowercase();
        let has_evidence = EVIDENCE_MARKERS.iter().any(|m| antecedent.contains(m));
        if !has_evidence {
            gaps.push(ReasoningGap {
                issue: "conclusion's antecedent lacks an evidence marker".to_string(),
                thought_number: entry.thought_number,
            });
        }
    }
    gaps
}

/// Bucket the conversation so far and recommend a starting mode. Informational only.
pub fn analyze_complexity(history: &[HistoryEntry]) -> (ComplexityBucket, &'static str) {
    let unique_tokens: HashSet<String> = history
        .iter()
        .flat_map(|e| tokenize(&e.text))
        .collect();

    let bucket = if history.len() <= 3 && unique_tokens.len() < 20 {
        ComplexityBucket::Simple
    } else if history.len() <= 8 && unique_tokens.len() < 60 {
        ComplexityBucket::Moderate
    } else {
        ComplexityBucket::Complex
    };

    let recommendation = match bucket {
        ComplexityBucket::Simple => "fast",
        ComplexityBucket::Moderate => "expert",
        ComplexityBucket::Complex => "deep",
    };
    (bucket, recommendation)
}

const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    ("software", &["code", "function", "bug", "api", "database", "server", "compile"]),
    ("mathematics", &["equation", "proof", "theorem", "matrix", "integral", "probability"]),
    ("business", &["revenue", "customer", "market", "strategy", "budget", "stakeholder"]),
    ("science", &["hypothesis", "experiment", "data", "observation", "measurement"]),
];

pub fn detect_domain(text: &str) -> String {
    let lower = text.to_lowercase();
    DOMAIN_KEYWORDS
        .iter()
        .map(|(domain, keywords)| {
            let score = keywords.iter().filter(|kw| lower.contains(*kw)).count();
            (*domain, score)
        })
        .max_by_key(|(_, score)| *score)
        .filter(|(_, score)| *score > 0)
        .map(|(domain, _)| domain.to_string())
        .unwrap_or_else(|| "general".to_string())
}

const PROCESS_KEYWORDS: &[(&str, &[&str])] = &[
    ("analysis", &["analyze", "examine", "break down", "decompose"]),
    ("synthesis", &["combine", "integrate", "merge", "bring together"]),
    ("evaluation", &["evaluate", "assess", "judge", "compare"]),
    ("planning", &["plan", "strategy", "next step", "approach"]),
];

pub fn detect_cognitive_process(text: &str) -> String {
    let lower = text.to_lowercase();
    PROCESS_KEYWORDS
        .iter()
        .map(|(process, keywords)| {
            let score = keywords.iter().filter(|kw| lower.contains(*kw)).count();
            (*process, score)
        })
        .max_by_key(|(_, score)| *score)
        .filter(|(_, score)| *score > 0)
        .map(|(process, _)| process.to_string())
        .unwrap_or_else(|| "exploration".to_string())
}

pub fn detect_meta_state(text: &str) -> String {
    let lower = text.to_lowercase();
    let hedges = HEDGE_WORDS.iter().filter(|h| lower.contains(*h)).count();
    let confident_markers = ["clearly", "certainly", "definitely", "confirmed"]
        .iter()
        .filter(|m| lower.contains(*m))
        .count();
    let stuck_markers = ["stuck", "confused", "not sure how", "dead end"]
        .iter()
        .filter(|m| lower.contains(*m))
        .count();

    if stuck_markers > 0 {
        "stuck".to_string()
    } else if confident_markers > hedges {
        "confident".to_string()
    } else if hedges > 0 {
        "uncertain".to_string()
    } else {
        "exploring".to_string()
    }
}

/// Confidence derived purely from hedge-word density (§4.3 step 8).
pub fn confidence_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let hedges = HEDGE_WORDS.iter().filter(|h| lower.contains(*h)).count();
    (1.0 - 0.15 * hedges as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u64, text: &str) -> HistoryEntry {
        HistoryEntry {
            thought_number: n,
            text: text.to_string(),
        }
    }

    #[test]
    fn tokenize_drops_short_words_and_stop_words() {
        let tokens = tokenize("The cat sat with them about this!");
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"cat".to_string())); // length 3, dropped
        assert!(!tokens.contains(&"with".to_string()));
    }

    #[test]
    fn jaccard_similarity_boundary_cases() {
        let empty: HashSet<String> = HashSet::new();
        assert_eq!(jaccard_similarity(&empty, &empty), 0.0);

        let a: HashSet<String> = ["alpha".to_string(), "beta".to_string()].into_iter().collect();
        assert_eq!(jaccard_similarity(&a, &a), 1.0);

        let b: HashSet<String> = ["gamma".to_string()].into_iter().collect();
        assert_eq!(jaccard_similarity(&a, &b), 0.0);
    }

    #[test]
    fn detect_circularity_flags_repeated_phrasing() {
        let history = vec![
            entry(1, "exploring the database connection pooling strategy"),
            entry(2, "considering alternative caching mechanisms entirely"),
            entry(3, "exploring the database connection pooling strategy again"),
        ];
        assert!(detect_circularity(&history).is_some());
    }

    #[test]
    fn detect_circularity_is_quiet_on_genuine_progress() {
        let history = vec![
            entry(1, "investigating the authentication failure"),
            entry(2, "found a stale token cache entry"),
            entry(3, "rotating credentials resolved the outage"),
        ];
        assert!(detect_circularity(&history).is_none());
    }

    #[test]
    fn analyze_reasoning_gaps_flags_early_conclusion() {
        let history = vec![entry(1, "therefore the migration is complete")];
        let gaps = analyze_reasoning_gaps(&history);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].thought_number, 1);
    }

    #[test]
    fn analyze_reasoning_gaps_flags_unsupported_conclusion() {
        let history = vec![
            entry(1, "looking at the logs"),
            entry(2, "checking the dashboards"),
            entry(3, "therefore the root cause is the disk"),
        ];
        let gaps = analyze_reasoning_gaps(&history);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].thought_number, 3);
    }

    #[test]
    fn analyze_reasoning_gaps_accepts_supported_conclusion() {
        let history = vec![
            entry(1, "looking at the logs"),
            entry(2, "the disk usage graph shows saturation because writes spiked"),
            entry(3, "therefore the root cause is the disk"),
        ];
        let gaps = analyze_reasoning_gaps(&history);
        assert!(gaps.is_empty());
    }

    #[test]
    fn detect_domain_picks_highest_scoring_bucket() {
        assert_eq!(detect_domain("the api server has a bug in the database query"), "software");
        assert_eq!(detect_domain("nothing domain specific here"), "general");
    }

    #[test]
    fn confidence_score_drops_with_hedges() {
        let hedged = confidence_score("maybe this is right, i think, but possibly not");
        let plain = confidence_score("this is correct");
        assert!(hedged < plain);
    }
}
