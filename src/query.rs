use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;

use crate::error::{MempackError, Result};

pub const MAX_QUERY_LEN: usize = 4096;

/// Variants per token when expanding a query; keeps pathological
/// identifiers from exploding the FTS expression.
const MAX_VARIANTS_PER_TOKEN: usize = 6;

/// Proximity window for the NEAR boost group.
const NEAR_DISTANCE: usize = 10;

static THREAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bT-[A-Za-z0-9_-]+\b").unwrap());
static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[\w./\\-]+\.(go|py|ts|js|tsx|jsx|md|json|yaml|yml|sql|sh)\b").unwrap()
});
static SYMBOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*\.[A-Z][A-Za-z0-9_]*\b").unwrap());

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "about", "at", "be", "by", "did", "do", "does", "for", "from", "how",
    "i", "in", "is", "it", "me", "my", "of", "on", "or", "our", "show", "that", "the", "this",
    "to", "was", "we", "were", "what", "when", "where", "which", "who", "why", "with", "you",
];

const THREAD_KEYWORDS: &[&str] = &["thread", "conversation", "discussion", "chat"];
const SYMBOL_KEYWORDS: &[&str] = &[
    "function", "method", "struct", "type ", "class", "interface", "func ", "def ", "fn ",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Search,
    Recent,
    Thread,
    Symbol,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Thread,
    File,
    Symbol,
}

#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub etype: EntityType,
    pub value: String,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeHint {
    pub relative: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedQuery {
    pub original: String,
    pub intent: Intent,
    pub entities: Vec<Entity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_hint: Option<TimeHint>,
    pub keywords: Vec<String>,
    pub fts_query: String,
    pub boost_recency: f64,
}

/// A non-noop token rewrite applied during query expansion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rewrite {
    pub original: String,
    pub rewritten: String,
}

impl Rewrite {
    pub fn display(&self) -> String {
        format!("{} -> {}", self.original, self.rewritten)
    }
}

/// Classify a natural-language query: intent, entities, temporal hint,
/// keywords, and the baseline FTS expression.
pub fn parse_query(q: &str) -> Result<ParsedQuery> {
    parse_query_at(q, Utc::now())
}

pub fn parse_query_at(q: &str, now: DateTime<Utc>) -> Result<ParsedQuery> {
    if q.len() > MAX_QUERY_LEN {
        return Err(MempackError::QueryTooLong {
            max: MAX_QUERY_LEN,
            got: q.len(),
        });
    }

    let original = q.trim().to_string();
    let lower = original.to_lowercase();

    let entities = extract_entities(&original);
    let time_hint = detect_time_hint(&lower, now);
    let boost_recency = time_hint.as_ref().map(|h| h.boost).unwrap_or(1.0);
    let intent = detect_intent(&lower, &entities, time_hint.is_some());

    // Keywords come from the query with entity text removed; the baseline
    // FTS expression keeps every token so its shape is stable.
    let mut remainder = original.clone();
    for entity in &entities {
        remainder = remainder.replace(&entity.raw, " ");
    }
    let keywords = extract_keywords(&remainder);
    let fts_query = sanitize(&original);

    Ok(ParsedQuery {
        original,
        intent,
        entities,
        time_hint: time_hint.map(|h| TimeHint {
            relative: h.relative,
            after: h.after,
        }),
        keywords,
        fts_query,
        boost_recency,
    })
}

struct DetectedHint {
    relative: String,
    after: Option<DateTime<Utc>>,
    boost: f64,
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

static NEW_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bnew (changes|updates|commits|activity|work)\b").unwrap()
});

fn detect_time_hint(lower: &str, now: DateTime<Utc>) -> Option<DetectedHint> {
    let day = start_of_day(now);
    if lower.contains("today") {
        return Some(DetectedHint {
            relative: "today".into(),
            after: Some(day),
            boost: 3.0,
        });
    }
    if lower.contains("yesterday") {
        return Some(DetectedHint {
            relative: "yesterday".into(),
            after: Some(day - Duration::days(1)),
            boost: 2.5,
        });
    }
    if lower.contains("this week") {
        return Some(DetectedHint {
            relative: "this week".into(),
            after: Some(day - Duration::days(7)),
            boost: 2.0,
        });
    }
    if lower.contains("last week") {
        return Some(DetectedHint {
            relative: "last week".into(),
            after: Some(day - Duration::days(14)),
            boost: 1.8,
        });
    }
    if lower.contains("latest") {
        return Some(DetectedHint {
            relative: "latest".into(),
            after: Some(now - Duration::days(3)),
            boost: 2.5,
        });
    }
    if lower.split_whitespace().any(|t| t == "just") {
        return Some(DetectedHint {
            relative: "just".into(),
            after: Some(now - Duration::days(1)),
            boost: 2.5,
        });
    }
    if lower.contains("recent") {
        return Some(DetectedHint {
            relative: "recent".into(),
            after: Some(now - Duration::days(7)),
            boost: 2.0,
        });
    }
    let solo_new = lower.split_whitespace().collect::<Vec<_>>() == ["new"];
    if lower.contains("what's new")
        || lower.contains("whats new")
        || lower.contains("show new")
        || NEW_PHRASE_RE.is_match(lower)
        || solo_new
    {
        return Some(DetectedHint {
            relative: "new".into(),
            after: Some(now - Duration::days(7)),
            boost: 1.5,
        });
    }
    None
}

fn extract_entities(q: &str) -> Vec<Entity> {
    let mut entities = Vec::new();
    for m in THREAD_RE.find_iter(q) {
        entities.push(Entity {
            etype: EntityType::Thread,
            value: m.as_str().to_string(),
            raw: m.as_str().to_string(),
        });
    }
    for m in FILE_RE.find_iter(q) {
        entities.push(Entity {
            etype: EntityType::File,
            value: m.as_str().to_string(),
            raw: m.as_str().to_string(),
        });
    }
    for m in SYMBOL_RE.find_iter(q) {
        let raw = m.as_str().to_string();
        // A file path with a matching extension is not a symbol.
        if entities
            .iter()
            .any(|e| e.etype == EntityType::File && e.raw.contains(&raw))
        {
            continue;
        }
        entities.push(Entity {
            etype: EntityType::Symbol,
            value: raw.clone(),
            raw,
        });
    }
    entities
}

fn detect_intent(lower: &str, entities: &[Entity], has_time_hint: bool) -> Intent {
    let has = |etype: EntityType| entities.iter().any(|e| e.etype == etype);
    if has(EntityType::Thread) || THREAD_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Intent::Thread;
    }
    if has(EntityType::Symbol) || SYMBOL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Intent::Symbol;
    }
    if has(EntityType::File) || lower.contains("file") {
        return Intent::File;
    }
    if has_time_hint {
        return Intent::Recent;
    }
    Intent::Search
}

fn trim_token(token: &str) -> &str {
    token.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
}

fn extract_keywords(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(trim_token)
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect();

    let pruned: Vec<String> = tokens
        .iter()
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .cloned()
        .collect();

    // All stop-words is still a query; fall back to the raw token set.
    if pruned.is_empty() { tokens } else { pruned }
}

fn quote(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

fn tokenize(q: &str) -> Vec<String> {
    q.split_whitespace()
        .map(trim_token)
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Baseline FTS expression: every token quoted and AND-ed, a prefix
/// alternative for a lone alphanumeric token, and a NEAR group boost when
/// two or more tokens are present.
pub fn sanitize(q: &str) -> String {
    let tokens = tokenize(q);
    if tokens.is_empty() {
        return String::new();
    }

    if tokens.len() == 1 {
        let tok = &tokens[0];
        let alnum = tok.chars().all(|c| c.is_alphanumeric());
        if alnum && tok.chars().count() >= 3 {
            return format!("({} OR {tok}*)", quote(tok));
        }
        return quote(tok);
    }

    let quoted: Vec<String> = tokens.iter().map(|t| quote(t)).collect();
    let near = format!("NEAR({}, {NEAR_DISTANCE})", quoted.join(" "));
    format!("{} OR {near}", quoted.join(" AND "))
}

/// Split an identifier-ish token at case boundaries, letter/digit
/// transitions, and `-`/`_` separators.
pub fn segment_token(token: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;

    for c in token.chars() {
        if c == '-' || c == '_' {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            prev = None;
            continue;
        }
        if let Some(p) = prev {
            let case_boundary = p.is_lowercase() && c.is_uppercase();
            let class_boundary = (p.is_alphabetic() && c.is_numeric())
                || (p.is_numeric() && c.is_alphabetic());
            if (case_boundary || class_boundary) && !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
        prev = Some(c);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn token_variants(token: &str) -> Vec<String> {
    let segments = segment_token(token);
    let mut variants = vec![token.to_string()];
    if segments.len() > 1 {
        variants.push(segments.join(" "));
        variants.push(segments.join("-"));
        variants.push(segments.join("_"));
        variants.push(segments.concat());
    }
    variants.dedup();
    let mut seen = Vec::new();
    for v in variants {
        if !seen.contains(&v) {
            seen.push(v);
        }
        if seen.len() >= MAX_VARIANTS_PER_TOKEN {
            break;
        }
    }
    seen
}

/// Rewrite-expanded FTS expression: each token becomes an OR-group of its
/// quoted variants. Returns the expression and the non-noop rewrites.
pub fn build_expanded(q: &str) -> (String, Vec<Rewrite>) {
    let tokens = tokenize(q);
    if tokens.is_empty() {
        return (String::new(), vec![]);
    }

    let mut groups = Vec::new();
    let mut rewrites = Vec::new();
    for token in &tokens {
        let variants = token_variants(token);
        if variants.len() == 1 {
            groups.push(quote(token));
            continue;
        }
        let spaced = segment_token(token).join(" ");
        if spaced != *token {
            rewrites.push(Rewrite {
                original: token.clone(),
                rewritten: spaced,
            });
        }
        let alternatives: Vec<String> = variants.iter().map(|v| quote(v)).collect();
        groups.push(format!("({})", alternatives.join(" OR ")));
    }
    (groups.join(" AND "), rewrites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(q: &str) -> ParsedQuery {
        parse_query(q).unwrap()
    }

    #[test]
    fn over_long_query_is_rejected() {
        let q = "x".repeat(MAX_QUERY_LEN + 1);
        let err = parse_query(&q).unwrap_err();
        assert_eq!(err.code(), "query_too_long");
    }

    #[test]
    fn empty_query_degrades_to_empty_expression() {
        let parsed = parse("");
        assert_eq!(parsed.fts_query, "");
        assert!(parsed.keywords.is_empty());
        assert_eq!(parsed.intent, Intent::Search);
        assert_eq!(parsed.boost_recency, 1.0);
    }

    #[test]
    fn thread_entity_wins_intent_priority() {
        let parsed = parse("what changed in T-auth-rework yesterday");
        assert_eq!(parsed.intent, Intent::Thread);
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].etype, EntityType::Thread);
        assert_eq!(parsed.entities[0].value, "T-auth-rework");
        // The temporal hint is still extracted alongside.
        assert_eq!(parsed.time_hint.as_ref().unwrap().relative, "yesterday");
        assert_eq!(parsed.boost_recency, 2.5);
    }

    #[test]
    fn file_entity_detected_by_extension() {
        let parsed = parse("errors in src/retry.ts");
        assert_eq!(parsed.intent, Intent::File);
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].etype, EntityType::File);
        assert_eq!(parsed.entities[0].value, "src/retry.ts");
    }

    #[test]
    fn symbol_entity_is_dotted_capitalized() {
        let parsed = parse("where is config.Resolve defined");
        assert_eq!(parsed.intent, Intent::Symbol);
        assert_eq!(parsed.entities[0].etype, EntityType::Symbol);
        assert_eq!(parsed.entities[0].value, "config.Resolve");
    }

    #[test]
    fn symbol_keyword_without_entity_still_signals() {
        let parsed = parse("the function handling retries");
        assert_eq!(parsed.intent, Intent::Symbol);
        assert!(parsed.entities.is_empty());
    }

    #[test]
    fn temporal_only_query_is_recent_intent() {
        let parsed = parse("what happened this week");
        assert_eq!(parsed.intent, Intent::Recent);
        assert_eq!(parsed.boost_recency, 2.0);
    }

    #[test]
    fn today_truncates_to_day_with_top_boost() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        let parsed = parse_query_at("today's work", now).unwrap();
        let hint = parsed.time_hint.unwrap();
        assert_eq!(hint.relative, "today");
        assert_eq!(
            hint.after.unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap()
        );
        assert_eq!(parsed.boost_recency, 3.0);
    }

    #[test]
    fn latest_has_three_day_window() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let parsed = parse_query_at("latest refactor", now).unwrap();
        let hint = parsed.time_hint.unwrap();
        assert_eq!(hint.after.unwrap(), now - Duration::days(3));
        assert_eq!(parsed.boost_recency, 2.5);
    }

    #[test]
    fn new_phrases_get_mild_boost() {
        assert_eq!(parse("what's new").boost_recency, 1.5);
        assert_eq!(parse("new changes").boost_recency, 1.5);
        assert_eq!(parse("new").boost_recency, 1.5);
        // "new" inside an unrelated phrase is not a recency signal.
        assert_eq!(parse("the new parser design").boost_recency, 1.0);
    }

    #[test]
    fn keywords_drop_stop_words_and_entities() {
        let parsed = parse("what is the retry budget in src/retry.ts");
        assert!(parsed.keywords.contains(&"retry".to_string()));
        assert!(parsed.keywords.contains(&"budget".to_string()));
        assert!(!parsed.keywords.iter().any(|k| k.contains("retry.ts")));
        assert!(!parsed.keywords.contains(&"the".to_string()));
    }

    #[test]
    fn all_stopword_query_falls_back_to_raw_tokens() {
        let parsed = parse("what is this");
        assert!(!parsed.keywords.is_empty());
        assert!(parsed.keywords.contains(&"what".to_string()));
    }

    #[test]
    fn sanitize_single_short_token_has_no_prefix() {
        assert_eq!(sanitize("ab"), "\"ab\"");
    }

    #[test]
    fn sanitize_single_long_token_gets_prefix_alternative() {
        assert_eq!(sanitize("retry"), "(\"retry\" OR retry*)");
    }

    #[test]
    fn sanitize_non_alnum_token_gets_no_prefix() {
        assert_eq!(sanitize("file-src"), "\"file-src\"");
    }

    #[test]
    fn sanitize_multi_token_appends_near_group() {
        assert_eq!(
            sanitize("retry budget"),
            "\"retry\" AND \"budget\" OR NEAR(\"retry\" \"budget\", 10)"
        );
    }

    #[test]
    fn sanitize_escapes_embedded_quotes() {
        assert_eq!(sanitize("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn baseline_matches_sanitize_for_plain_queries() {
        // No entities, no temporal hint, search intent.
        let parsed = parse("retry budget exhaustion");
        assert_eq!(parsed.intent, Intent::Search);
        assert!(parsed.entities.is_empty());
        assert!(parsed.time_hint.is_none());
        assert_eq!(parsed.fts_query, sanitize("retry budget exhaustion"));
    }

    #[test]
    fn segments_split_on_separators_case_and_digits() {
        assert_eq!(segment_token("file-src-app-ts"), vec!["file", "src", "app", "ts"]);
        assert_eq!(segment_token("file_src"), vec!["file", "src"]);
        assert_eq!(segment_token("CamelCase"), vec!["Camel", "Case"]);
        assert_eq!(segment_token("abc123def"), vec!["abc", "123", "def"]);
        assert_eq!(segment_token("plain"), vec!["plain"]);
    }

    #[test]
    fn expanded_query_groups_variants_and_reports_rewrites() {
        let (expanded, rewrites) = build_expanded("file-src-app-ts");
        assert!(expanded.starts_with('('));
        assert!(expanded.contains("\"file src app ts\""));
        assert!(expanded.contains("\"file_src_app_ts\""));
        assert!(expanded.contains("\"filesrcappts\""));
        assert_eq!(rewrites.len(), 1);
        assert_eq!(rewrites[0].display(), "file-src-app-ts -> file src app ts");
    }

    #[test]
    fn expanded_query_is_noop_for_plain_tokens() {
        let (expanded, rewrites) = build_expanded("plain words");
        assert_eq!(expanded, "\"plain\" AND \"words\"");
        assert!(rewrites.is_empty());
    }

    #[test]
    fn variants_are_capped() {
        let token = "a-b-c-d-e-f-g-h";
        assert!(token_variants(token).len() <= MAX_VARIANTS_PER_TOKEN);
    }
}
