//! Clasificación de intención única, compartida por el procesador NLP y por
//! la construcción del plan del orquestador.

use serde::{Deserialize, Serialize};

use crate::vocabulary::Vocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Search,
    Count,
    Compare,
    Analyze,
    Aggregate,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Search => "search",
            Intent::Count => "count",
            Intent::Compare => "compare",
            Intent::Analyze => "analyze",
            Intent::Aggregate => "aggregate",
        }
    }
}

/// Resultado tipado de la clasificación.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentAnalysis {
    pub intent: Intent,
    /// Aciertos de patrón por intención, en el orden del vocabulario.
    pub scores: Vec<(Intent, usize)>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct IntentClassifier<'a> {
    vocabulary: &'a Vocabulary,
}

impl<'a> IntentClassifier<'a> {
    pub fn new(vocabulary: &'a Vocabulary) -> Self {
        Self { vocabulary }
    }

    /// Puntúa cada intención por número de patrones que encajan en la
    /// consulta normalizada. Gana la mayor puntuación; un empate en cabeza
    /// o ningún acierto devuelve `Search`.
    pub fn classify(&self, normalized_query: &str) -> IntentAnalysis {
        let scores: Vec<(Intent, usize)> = self
            .vocabulary
            .intent_patterns
            .iter()
            .map(|(intent, patterns)| {
                let hits = patterns.iter().filter(|p| p.is_match(normalized_query)).count();
                (*intent, hits)
            })
            .collect();

        let best = scores.iter().map(|(_, s)| *s).max().unwrap_or(0);
        let leaders: Vec<Intent> = scores
            .iter()
            .filter(|(_, s)| *s == best)
            .map(|(i, _)| *i)
            .collect();

        let intent = if best == 0 || leaders.len() > 1 {
            Intent::Search
        } else {
            leaders[0]
        };

        let confidence = if best == 0 {
            0.2
        } else {
            (0.3 * best as f64).min(1.0)
        };

        IntentAnalysis {
            intent,
            scores,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(query: &str) -> IntentAnalysis {
        let vocab = Vocabulary::embedded().unwrap();
        IntentClassifier::new(&vocab).classify(query)
    }

    #[test]
    fn picks_the_highest_scoring_intent() {
        let analysis = classify("how many rows over performed");
        assert_eq!(analysis.intent, Intent::Count);
        assert!((analysis.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn no_match_defaults_to_search_with_floor() {
        let analysis = classify("aetna");
        assert_eq!(analysis.intent, Intent::Search);
        assert!((analysis.confidence - 0.2).abs() < 1e-9);
    }

    #[test]
    fn tie_defaults_to_search() {
        // "compare" y "trend" aciertan un patrón cada uno.
        let analysis = classify("compare trend");
        assert_eq!(analysis.intent, Intent::Search);
    }

    #[test]
    fn aggregate_words_win() {
        let analysis = classify("total and average payment amount");
        assert_eq!(analysis.intent, Intent::Aggregate);
        assert!((analysis.confidence - 0.6).abs() < 1e-9);
    }
}
