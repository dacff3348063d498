//! Procesador NLP de primer nivel: normaliza la consulta, clasifica su
//! intención y extrae fragmentos con los vocabularios estáticos.
//!
//! Es una pasada barata; la resolución precisa contra los datos la hace
//! `resolver::EntityResolver` con la taxonomía.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::{
    intent::{Intent, IntentAnalysis, IntentClassifier},
    vocabulary::Vocabulary,
};

const MIN_TOKEN_LEN: usize = 3;

/// Entidades del vocabulario estático encontradas en la consulta.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StaticMatches {
    pub insurance: Vec<String>,
    pub metric: Vec<String>,
    pub operation: Vec<String>,
}

impl StaticMatches {
    fn all(&self) -> impl Iterator<Item = &String> {
        self.insurance
            .iter()
            .chain(self.metric.iter())
            .chain(self.operation.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NlpResult {
    pub original_query: String,
    pub normalized_query: String,
    pub intent: Intent,
    pub intent_analysis: IntentAnalysis,
    pub entities: StaticMatches,
    pub temporal: Vec<String>,
    pub numerical: Vec<String>,
    pub search_terms: Vec<String>,
    pub confidence: f64,
}

/// Minúsculas, sin puntuación salvo guiones, espacios colapsados.
pub fn normalize(query: &str) -> String {
    let cleaned: String = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c.is_whitespace() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `true` si `phrase` aparece como secuencia completa de palabras.
pub fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    format!(" {normalized} ").contains(&format!(" {phrase} "))
}

pub struct QueryProcessor<'a> {
    vocabulary: &'a Vocabulary,
}

impl<'a> QueryProcessor<'a> {
    pub fn new(vocabulary: &'a Vocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn process(&self, query: &str) -> NlpResult {
        let normalized = normalize(query);
        let analysis = IntentClassifier::new(self.vocabulary).classify(&normalized);
        self.process_with_intent(query, normalized, analysis)
    }

    /// Igual que `process` pero reutilizando una clasificación ya hecha, de
    /// modo que orquestador y procesador comparten la misma intención.
    pub fn process_with_intent(&self, query: &str, normalized: String, analysis: IntentAnalysis) -> NlpResult {
        let entities = self.extract_static_entities(&normalized);
        let lowered = query.to_lowercase();
        let temporal = find_all(&self.vocabulary.temporal_patterns, &lowered);
        let numerical = find_all(&self.vocabulary.numeric_patterns, &lowered);
        let search_terms = self.search_terms(&normalized, &entities);

        let mut confidence = analysis.confidence;
        if !entities.insurance.is_empty() {
            confidence += 0.2;
        }
        if !entities.metric.is_empty() {
            confidence += 0.2;
        }
        if !entities.operation.is_empty() {
            confidence += 0.15;
        }

        NlpResult {
            original_query: query.to_string(),
            normalized_query: normalized,
            intent: analysis.intent,
            intent_analysis: analysis,
            entities,
            temporal,
            numerical,
            search_terms,
            confidence: confidence.min(1.0),
        }
    }

    fn extract_static_entities(&self, normalized: &str) -> StaticMatches {
        let matching = |terms: &[String]| -> Vec<String> {
            terms
                .iter()
                .filter(|term| contains_phrase(normalized, term))
                .cloned()
                .collect()
        };
        let vocab = &self.vocabulary.static_entities;
        StaticMatches {
            insurance: matching(&vocab.insurance),
            metric: matching(&vocab.metric),
            operation: matching(&vocab.operation),
        }
    }

    /// Entidades estáticas más las palabras con contenido, sin repetir,
    /// de la más larga (más específica) a la más corta.
    fn search_terms(&self, normalized: &str, entities: &StaticMatches) -> Vec<String> {
        let mut terms: BTreeSet<String> = entities.all().cloned().collect();
        for token in normalized.split_whitespace() {
            let token = token.trim_matches('-');
            let has_letter = token.chars().any(char::is_alphabetic);
            let word_like = token.chars().all(|c| c.is_alphanumeric() || c == '-');
            if has_letter
                && word_like
                && token.chars().count() >= MIN_TOKEN_LEN
                && !self.vocabulary.is_stop_word(token)
            {
                terms.insert(token.to_string());
            }
        }
        let mut terms: Vec<String> = terms.into_iter().collect();
        terms.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        terms
    }
}

fn find_all(patterns: &[regex::Regex], text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for pattern in patterns {
        for m in pattern.find_iter(text) {
            let fragment = m.as_str().trim().to_string();
            if !found.iter().any(|f| f == &fragment || f.contains(&fragment)) {
                found.push(fragment);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(query: &str) -> NlpResult {
        let vocab = Vocabulary::embedded().unwrap();
        QueryProcessor::new(&vocab).process(query)
    }

    #[test]
    fn normalization_keeps_hyphens() {
        assert_eq!(normalize("  Show me 12-AETNA's   notes!? "), "show me 12-aetna s notes");
    }

    #[test]
    fn phrase_matching_respects_word_boundaries() {
        assert!(contains_phrase("what went well for aetna", "went well"));
        assert!(!contains_phrase("unitedhealthcare", "united"));
    }

    #[test]
    fn extracts_static_entities_and_terms() {
        let result = process("Show me Aetna payments for week 12 in 2024");
        assert_eq!(result.entities.insurance, vec!["aetna"]);
        assert_eq!(result.entities.metric, vec!["payments"]);
        assert!(result.temporal.contains(&"week 12".to_string()));
        assert!(result.temporal.contains(&"2024".to_string()));
        assert!(result.numerical.contains(&"12".to_string()));
        assert_eq!(result.search_terms, vec!["payments", "aetna", "week"]);
    }

    #[test]
    fn longer_terms_come_first() {
        let result = process("what went well for blue cross");
        assert_eq!(result.search_terms.first().map(String::as_str), Some("what went well"));
        assert!(result.search_terms.contains(&"blue cross".to_string()));
        assert!(!result.search_terms.contains(&"for".to_string()));
    }

    #[test]
    fn confidence_adds_category_bonuses() {
        // búsqueda: "show" (0.3) + aseguradora (0.2) + métrica (0.2)
        let result = process("show aetna payments");
        assert!((result.confidence - 0.7).abs() < 1e-9);

        let unknown = process("zzz qqq");
        assert!((unknown.confidence - 0.2).abs() < 1e-9);
        assert_eq!(unknown.intent, Intent::Search);
    }
}
