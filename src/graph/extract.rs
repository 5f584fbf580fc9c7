//! Entity and relationship extraction.
//!
//! The graph builder talks to an [`Extractor`]; [`RuleExtractor`] is the built-in
//! heuristic one (metadata anchors, cue-word vocabulary, time and place words).
//! A model-backed extractor can be dropped in behind the same trait.

use serde::Serialize;

use super::types::{normalize_label, EntityType, RelationType};
use crate::memory::types::{MemoryRecord, Source};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    /// Normalized label.
    pub label: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, label: &str) -> Option<Self> {
        let label = normalize_label(label);
        (!label.is_empty()).then_some(Self { entity_type, label })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationCandidate {
    pub source: EntityRef,
    pub target: EntityRef,
    pub relation: RelationType,
    /// How sure the extractor is, in `(0, 1]`.
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Extraction {
    pub entities: Vec<EntityRef>,
    pub relationships: Vec<RelationCandidate>,
}

impl Extraction {
    fn add_entity(&mut self, entity: &EntityRef) {
        if !self.entities.contains(entity) {
            self.entities.push(entity.clone());
        }
    }

    fn relate(&mut self, source: &EntityRef, target: &EntityRef, relation: RelationType, confidence: f64) {
        if source == target {
            return;
        }
        self.add_entity(source);
        self.add_entity(target);
        let candidate = RelationCandidate {
            source: source.clone(),
            target: target.clone(),
            relation,
            confidence,
        };
        if !self.relationships.iter().any(|r| {
            r.source == candidate.source && r.target == candidate.target && r.relation == relation
        }) {
            self.relationships.push(candidate);
        }
    }
}

pub trait Extractor: Send + Sync {
    fn extract(&self, record: &MemoryRecord) -> Extraction;
}

const CUE_CONFIDENCE: f64 = 0.8;
const TIME_CONFIDENCE: f64 = 0.6;
const PLACE_CONFIDENCE: f64 = 0.5;

/// Longest phrases first so "leads to" wins over a shorter overlap.
const CUES: &[(&str, RelationType)] = &[
    ("reduces risk of", RelationType::Prevents),
    ("reduces the risk of", RelationType::Prevents),
    ("protects against", RelationType::Prevents),
    ("makes worse", RelationType::Worsens),
    ("leads to", RelationType::Causes),
    ("led to", RelationType::Causes),
    ("gives me", RelationType::Causes),
    ("similar to", RelationType::SimilarTo),
    ("related to", RelationType::RelatedTo),
    ("linked to", RelationType::RelatedTo),
    ("part of", RelationType::BelongsTo),
    ("belongs to", RelationType::BelongsTo),
    ("improves", RelationType::Improves),
    ("improved", RelationType::Improves),
    ("helps", RelationType::Improves),
    ("helped", RelationType::Improves),
    ("boosts", RelationType::Improves),
    ("boosted", RelationType::Improves),
    ("worsens", RelationType::Worsens),
    ("worsened", RelationType::Worsens),
    ("hurts", RelationType::Worsens),
    ("causes", RelationType::Causes),
    ("caused", RelationType::Causes),
    ("triggers", RelationType::Causes),
    ("triggered", RelationType::Causes),
    ("prevents", RelationType::Prevents),
    ("prevented", RelationType::Prevents),
];

const TIME_WORDS: &[&str] = &[
    "morning", "afternoon", "evening", "night", "tonight", "bedtime", "midnight", "noon",
    "weekend", "weekday", "daily", "weekly", "monthly", "monday", "tuesday", "wednesday",
    "thursday", "friday", "saturday", "sunday",
];

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "was", "are", "were", "be", "been", "it", "its", "this", "that",
    "these", "those", "i", "we", "you", "he", "she", "they", "my", "our", "your", "his",
    "her", "their", "and", "or", "but", "so", "to", "of", "in", "on", "at", "by", "for",
    "with", "from", "really", "very", "also", "always", "usually", "which", "me", "some",
];

/// Words that end an object phrase.
const CLAUSE_BREAKS: &[&str] = &[
    "and", "but", "because", "so", "when", "while", "if", "at", "in", "on", "during", "after",
    "before", "since",
];

const PLACE_MARKERS: &[&str] = &["at", "in"];

const MAX_PHRASE_WORDS: usize = 3;

#[derive(Debug, Default, Clone, Copy)]
pub struct RuleExtractor;

fn is_stop(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

fn is_time(word: &str) -> bool {
    TIME_WORDS.contains(&word)
}

fn words_of(sentence: &str) -> Vec<String> {
    sentence
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

fn trim_stops(words: &[String]) -> &[String] {
    let start = words.iter().position(|w| !is_stop(w)).unwrap_or(words.len());
    let end = words.iter().rposition(|w| !is_stop(w)).map_or(start, |i| i + 1);
    &words[start..end.max(start)]
}

/// Earliest cue in `words`; `(position, length, relation)`.
fn find_cue(words: &[String]) -> Option<(usize, usize, RelationType)> {
    for i in 0..words.len() {
        for (phrase, relation) in CUES {
            let parts: Vec<&str> = phrase.split(' ').collect();
            if words.len() >= i + parts.len()
                && words[i..i + parts.len()].iter().zip(&parts).all(|(w, p)| w == p)
            {
                return Some((i, parts.len(), *relation));
            }
        }
    }
    None
}

/// The metadata entity a record is about, if it names one.
fn anchor(record: &MemoryRecord) -> Option<EntityRef> {
    let by_key = |key: &str, ty: EntityType| record.metadata.get(key).and_then(|v| EntityRef::new(ty, v));
    let named_type = match record.source {
        Source::Medication => EntityType::Medication,
        Source::Habit => EntityType::Habit,
        _ => EntityType::Concept,
    };
    by_key("medication", EntityType::Medication)
        .or_else(|| by_key("habit", EntityType::Habit))
        .or_else(|| by_key("name", named_type))
        .or_else(|| by_key("person", EntityType::Person))
}

impl RuleExtractor {
    fn sentence(&self, words: &[String], anchor: Option<&EntityRef>, out: &mut Extraction) {
        let cue = find_cue(words);
        let subject = match (anchor, cue) {
            (Some(a), _) => Some(a.clone()),
            (None, Some((at, _, _))) => {
                let before = trim_stops(&words[..at]);
                let tail = &before[before.len().saturating_sub(MAX_PHRASE_WORDS)..];
                EntityRef::new(EntityType::Activity, &tail.join(" "))
            }
            (None, None) => None,
        };

        if let (Some(subject), Some((at, len, relation))) = (&subject, cue) {
            let after = &words[at + len..];
            let end = after
                .iter()
                .position(|w| CLAUSE_BREAKS.contains(&w.as_str()))
                .unwrap_or(after.len());
            let phrase = trim_stops(&after[..end]);
            let phrase = &phrase[..phrase.len().min(MAX_PHRASE_WORDS + 1)];
            let ty = if phrase.len() == 1 && is_time(&phrase[0]) {
                EntityType::Time
            } else {
                EntityType::Concept
            };
            if let Some(object) = EntityRef::new(ty, &phrase.join(" ")) {
                out.relate(subject, &object, relation, CUE_CONFIDENCE);
            }
        }

        for (i, word) in words.iter().enumerate() {
            if is_time(word) {
                let Some(time) = EntityRef::new(EntityType::Time, word) else {
                    continue;
                };
                match &subject {
                    Some(s) => out.relate(s, &time, RelationType::OccursAt, TIME_CONFIDENCE),
                    None => out.add_entity(&time),
                }
                continue;
            }
            if !PLACE_MARKERS.contains(&word.as_str()) {
                continue;
            }
            let Some(subject) = &subject else {
                continue;
            };
            let rest = &words[i + 1..];
            let rest = match rest.first().map(String::as_str) {
                Some("the" | "my" | "a" | "our") => &rest[1..],
                _ => rest,
            };
            let place: Vec<&str> = rest
                .iter()
                .take_while(|w| !is_stop(w) && !is_time(w) && !CLAUSE_BREAKS.contains(&w.as_str()))
                .take(2)
                .map(String::as_str)
                .collect();
            if place.is_empty() || place[0].chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if let Some(location) = EntityRef::new(EntityType::Location, &place.join(" ")) {
                out.relate(subject, &location, RelationType::OccursAt, PLACE_CONFIDENCE);
            }
        }
    }
}

impl Extractor for RuleExtractor {
    fn extract(&self, record: &MemoryRecord) -> Extraction {
        let mut out = Extraction::default();
        let anchor = anchor(record);
        if let Some(a) = &anchor {
            out.add_entity(a);
        }
        if let Some(location) = record
            .metadata
            .get("location")
            .and_then(|v| EntityRef::new(EntityType::Location, v))
        {
            match &anchor {
                Some(a) => out.relate(a, &location, RelationType::OccursAt, CUE_CONFIDENCE),
                None => out.add_entity(&location),
            }
        }
        for sentence in record.text.split(['.', '!', '?', ';', '\n']) {
            let words = words_of(sentence);
            if !words.is_empty() {
                self.sentence(&words, anchor.as_ref(), &mut out);
            }
        }
        out
    }
}
