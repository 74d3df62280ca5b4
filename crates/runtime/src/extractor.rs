//! LLM-backed extraction of entities and events from evicted text.
//!
//! The LLM is prompted for a bare JSON object; real models wrap it in
//! fences, prefix prose, or return garbage, so parsing is an explicit ladder
//! of strategies tried in order until one yields an object. A contract
//! violation is never an error: the job degrades to an empty extraction and
//! the raw chunk keeps its provenance.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::inference::{InferenceOptions, InferenceProvider};
use crate::types::{MemoryError, Message};

const EXTRACTION_SYSTEM_PROMPT: &str = "\
You are a knowledge extraction engine. Given a conversation transcript, \
extract entities (nouns: people, files, variables, places) and events \
(timestamped actions). Respond with ONLY a JSON object of this exact shape, \
no prose, no markdown fences:
{\"entities\": [{\"name\": \"...\", \"subtype\": \"...\", \"description\": \"...\"}], \
\"events\": [{\"name\": \"...\", \"subtype\": \"...\", \"description\": \"...\", \
\"caused_by\": [\"entity name\"], \"next_event\": null}]}";

const INTENT_SYSTEM_PROMPT: &str = "\
Classify the intent of the user query into exactly one of: coding, creative, \
general. Respond with ONLY a JSON object: {\"intent\": \"...\"}";

/// An extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub subtype: String,
    pub description: String,
}

/// An extracted event, with the entity names that initiated it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEvent {
    pub name: String,
    pub subtype: String,
    pub description: String,
    pub caused_by: Vec<String>,
    pub next_event: Option<String>,
}

/// Result of extracting a text chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub entities: Vec<ExtractedEntity>,
    pub events: Vec<ExtractedEvent>,
}

/// Classified intent of a retrieval query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    Coding,
    Creative,
    General,
}

impl QueryIntent {
    /// Domain this intent maps to for vector filtering, if any.
    pub fn domain(&self) -> Option<&'static str> {
        match self {
            QueryIntent::Coding => Some("coding"),
            QueryIntent::Creative => Some("story"),
            QueryIntent::General => None,
        }
    }
}

/// LLM-backed extractor. Constructed once at startup and passed by
/// reference to the ingestion worker and retriever.
pub struct Extractor {
    llm: Arc<dyn InferenceProvider>,
    max_tokens: u32,
}

impl Extractor {
    pub fn new(llm: Arc<dyn InferenceProvider>, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }

    fn options(&self) -> InferenceOptions {
        InferenceOptions {
            max_tokens: self.max_tokens,
            temperature: 0.1,
            json_object: true,
        }
    }

    /// Extract entities and events from a text chunk. Transport failures
    /// propagate; contract violations yield an empty extraction.
    pub async fn extract(&self, text: &str, domain: &str) -> Result<Extraction, MemoryError> {
        let messages = vec![
            Message::system(EXTRACTION_SYSTEM_PROMPT),
            Message::user(format!("Domain: {domain}\n\nTranscript:\n{text}")),
        ];

        let raw = self
            .llm
            .generate_with_retry(&messages, &self.options(), 2)
            .await?;

        match parse_json_object(&raw) {
            Some(value) => Ok(normalize_extraction(&value)),
            None => {
                warn!("extraction response was not parseable JSON, returning empty");
                Ok(Extraction::default())
            }
        }
    }

    /// Summarize a set of texts into one description (used by the sleep
    /// cycle to name MacroEvents).
    pub async fn summarize(&self, texts: &[String]) -> Result<String, MemoryError> {
        let combined = texts.join("\n");
        let messages = vec![
            Message::system(
                "Summarize the following events into a single short description \
                 of what happened. Respond with plain text only.",
            ),
            Message::user(combined),
        ];

        let options = InferenceOptions {
            max_tokens: self.max_tokens,
            temperature: 0.1,
            json_object: false,
        };
        self.llm.generate_with_retry(&messages, &options, 2).await
    }

    /// Classify a query's intent, falling back to keywords and finally to
    /// `General` — this method never fails.
    pub async fn classify_intent(&self, query: &str) -> QueryIntent {
        let messages = vec![
            Message::system(INTENT_SYSTEM_PROMPT),
            Message::user(query.to_string()),
        ];

        let options = InferenceOptions {
            max_tokens: 50,
            temperature: 0.1,
            json_object: true,
        };

        match self.llm.generate(&messages, &options).await {
            Ok(raw) => {
                if let Some(value) = parse_json_object(&raw) {
                    if let Some(intent) = value
                        .get("intent")
                        .and_then(|i| i.as_str())
                        .and_then(parse_intent)
                    {
                        return intent;
                    }
                }
                debug!("intent response unparseable, using keyword fallback");
                keyword_intent(query)
            }
            Err(e) => {
                warn!(error = %e, "intent classification failed, using keyword fallback");
                keyword_intent(query)
            }
        }
    }
}

fn parse_intent(s: &str) -> Option<QueryIntent> {
    match s.to_lowercase().as_str() {
        "coding" => Some(QueryIntent::Coding),
        "creative" => Some(QueryIntent::Creative),
        "general" => Some(QueryIntent::General),
        _ => None,
    }
}

/// Keyword fallback when the LLM's answer is unusable.
fn keyword_intent(query: &str) -> QueryIntent {
    let lower = query.to_lowercase();
    const CODING: [&str; 8] = [
        "code", "function", "bug", "compile", "implement", "refactor", "variable", "api",
    ];
    const CREATIVE: [&str; 6] = ["story", "character", "novel", "poem", "plot", "scene"];

    if CODING.iter().any(|k| lower.contains(k)) {
        QueryIntent::Coding
    } else if CREATIVE.iter().any(|k| lower.contains(k)) {
        QueryIntent::Creative
    } else {
        QueryIntent::General
    }
}

/// Parse a JSON object out of LLM output. An explicit ladder, tried in
/// order:
/// 1. the raw text as JSON
/// 2. the text with fenced-code markers stripped
/// 3. the first greedy `{ ... }` substring
///
/// Anything else — prose, markdown, empty output — is a failure.
pub(crate) fn parse_json_object(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let fence = Regex::new(r"^```(?:json)?\s*|\s*```$").ok()?;
    let defenced = fence.replace_all(trimmed, "");
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(defenced.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&trimmed[start..=end]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    None
}

fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Coerce a parsed value into an [`Extraction`], dropping malformed items.
pub(crate) fn normalize_extraction(value: &serde_json::Value) -> Extraction {
    let mut extraction = Extraction::default();

    if let Some(entities) = value.get("entities").and_then(|e| e.as_array()) {
        for entity in entities {
            let Some(name) = string_field(entity, "name").filter(|n| !n.trim().is_empty()) else {
                continue;
            };
            extraction.entities.push(ExtractedEntity {
                name,
                subtype: string_field(entity, "subtype").unwrap_or_else(|| "Entity".to_string()),
                description: string_field(entity, "description").unwrap_or_default(),
            });
        }
    }

    if let Some(events) = value.get("events").and_then(|e| e.as_array()) {
        for event in events {
            let Some(name) = string_field(event, "name").filter(|n| !n.trim().is_empty()) else {
                continue;
            };
            let caused_by = event
                .get("caused_by")
                .and_then(|c| c.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let next_event = event
                .get("next_event")
                .and_then(|n| n.as_str())
                .map(str::to_string);

            extraction.events.push(ExtractedEvent {
                name,
                subtype: string_field(event, "subtype").unwrap_or_else(|| "Event".to_string()),
                description: string_field(event, "description").unwrap_or_default(),
                caused_by,
                next_event,
            });
        }
    }

    extraction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_json_parses() {
        let value = parse_json_object(r#"{"entities": [], "events": []}"#).unwrap();
        assert!(value.is_object());
    }

    #[test]
    fn fenced_json_parses() {
        let raw = "```json\n{\"entities\": [], \"events\": []}\n```";
        assert!(parse_json_object(raw).is_some());

        let bare_fence = "```\n{\"intent\": \"coding\"}\n```";
        assert!(parse_json_object(bare_fence).is_some());
    }

    #[test]
    fn embedded_object_parses() {
        let raw = "Here is the extraction you asked for:\n{\"entities\": [{\"name\": \"Alice\"}], \"events\": []} hope that helps!";
        let value = parse_json_object(raw).unwrap();
        assert_eq!(value["entities"][0]["name"], "Alice");
    }

    #[test]
    fn pure_prose_fails() {
        assert!(parse_json_object("# Summary\n\nThe conversation covered…").is_none());
        assert!(parse_json_object("").is_none());
        assert!(parse_json_object("I could not extract anything.").is_none());
    }

    #[test]
    fn top_level_array_is_rejected() {
        assert!(parse_json_object("[1, 2, 3]").is_none());
    }

    #[test]
    fn normalize_fills_defaults_and_drops_malformed() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{
                "entities": [
                    {"name": "Alice"},
                    {"subtype": "missing name"},
                    {"name": ""},
                    42
                ],
                "events": [
                    {"name": "Meeting", "caused_by": ["Alice", 7]},
                    {"description": "no name"}
                ]
            }"#,
        )
        .unwrap();

        let extraction = normalize_extraction(&value);
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].name, "Alice");
        assert_eq!(extraction.entities[0].subtype, "Entity");

        assert_eq!(extraction.events.len(), 1);
        assert_eq!(extraction.events[0].name, "Meeting");
        assert_eq!(extraction.events[0].subtype, "Event");
        // the numeric entry in caused_by is dropped, the string kept
        assert_eq!(extraction.events[0].caused_by, vec!["Alice"]);
    }

    #[test]
    fn keyword_fallback_covers_the_three_intents() {
        assert_eq!(keyword_intent("why does this function not compile"), QueryIntent::Coding);
        assert_eq!(keyword_intent("continue the story about the dragon"), QueryIntent::Creative);
        assert_eq!(keyword_intent("what's the weather like"), QueryIntent::General);
    }
}
