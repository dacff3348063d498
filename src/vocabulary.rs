//! Vocabularios estáticos (patrones de intención, palabras vacías,
//! sinónimos, alias de columnas...) cargados como tablas tipadas desde JSON.
//!
//! El fichero por defecto va embebido en el binario; `VOCABULARY_PATH`
//! permite sustituirlo sin recompilar.

use std::{collections::HashSet, fs, path::Path};

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::intent::Intent;

const EMBEDDED_VOCABULARY: &str = include_str!("../config/vocabulary.json");

#[derive(Debug, Deserialize)]
struct VocabularyFile {
    intent_patterns: IntentPatternsFile,
    stop_words: Vec<String>,
    static_entities: StaticEntities,
    temporal_patterns: Vec<String>,
    numeric_patterns: Vec<String>,
    role_keywords: RoleKeywords,
    synonym_groups: Vec<Vec<String>>,
    column_aliases: Vec<ColumnAlias>,
    column_rules: Vec<ColumnRuleFile>,
    performance_synonyms: Vec<PerformanceSynonyms>,
}

#[derive(Debug, Deserialize)]
struct IntentPatternsFile {
    search: Vec<String>,
    count: Vec<String>,
    compare: Vec<String>,
    analyze: Vec<String>,
    aggregate: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ColumnRuleFile {
    pattern: String,
    column_contains: String,
}

/// Categorías de entidades del vocabulario estático (primer nivel, barato).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticEntities {
    pub insurance: Vec<String>,
    pub metric: Vec<String>,
    pub operation: Vec<String>,
}

/// Palabras clave para clasificar nombres de columna por rol.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleKeywords {
    pub narrative: Vec<String>,
    pub identifier: Vec<String>,
    pub metric: Vec<String>,
}

/// Frase natural → nombres literales de columna.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnAlias {
    pub phrase: String,
    pub columns: Vec<String>,
}

/// Regla por patrón: si la consulta encaja, se eligen las columnas cuyo
/// nombre contiene `column_contains`.
#[derive(Debug, Clone)]
pub struct ColumnRule {
    pub pattern: Regex,
    pub column_contains: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceSynonyms {
    /// Palabra que debe aparecer en el valor de la categoría (`over`, `under`...).
    pub matches: String,
    pub synonyms: Vec<String>,
}

/// Vocabulario compilado y listo para usar.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub intent_patterns: Vec<(Intent, Vec<Regex>)>,
    pub stop_words: HashSet<String>,
    pub static_entities: StaticEntities,
    pub temporal_patterns: Vec<Regex>,
    pub numeric_patterns: Vec<Regex>,
    pub role_keywords: RoleKeywords,
    pub synonym_groups: Vec<Vec<String>>,
    pub column_aliases: Vec<ColumnAlias>,
    pub column_rules: Vec<ColumnRule>,
    pub performance_synonyms: Vec<PerformanceSynonyms>,
}

impl Vocabulary {
    /// Vocabulario embebido en el binario.
    pub fn embedded() -> Result<Self> {
        Self::from_json(EMBEDDED_VOCABULARY)
    }

    /// Carga desde fichero si se indica una ruta; si no, el embebido.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("No se pudo leer el vocabulario {}", path.display()))?;
                Self::from_json(&raw)
                    .with_context(|| format!("Vocabulario inválido en {}", path.display()))
            }
            None => Self::embedded(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: VocabularyFile = serde_json::from_str(raw)?;

        let intents = file.intent_patterns;
        let intent_patterns = vec![
            (Intent::Search, compile_all(&intents.search)?),
            (Intent::Count, compile_all(&intents.count)?),
            (Intent::Compare, compile_all(&intents.compare)?),
            (Intent::Analyze, compile_all(&intents.analyze)?),
            (Intent::Aggregate, compile_all(&intents.aggregate)?),
        ];

        let column_rules = file
            .column_rules
            .into_iter()
            .map(|rule| {
                Ok(ColumnRule {
                    pattern: compile(&rule.pattern)?,
                    column_contains: rule.column_contains.to_lowercase(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            intent_patterns,
            stop_words: file.stop_words.into_iter().map(|w| w.to_lowercase()).collect(),
            static_entities: lowercase_entities(file.static_entities),
            temporal_patterns: compile_all(&file.temporal_patterns)?,
            numeric_patterns: compile_all(&file.numeric_patterns)?,
            role_keywords: file.role_keywords,
            synonym_groups: file
                .synonym_groups
                .into_iter()
                .map(|group| group.into_iter().map(|s| s.to_lowercase()).collect())
                .collect(),
            column_aliases: file.column_aliases,
            column_rules,
            performance_synonyms: file.performance_synonyms,
        })
    }

    pub fn is_stop_word(&self, word: &str) -> bool {
        self.stop_words.contains(word)
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| anyhow!("Patrón inválido '{pattern}': {e}"))
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile(p)).collect()
}

fn lowercase_entities(entities: StaticEntities) -> StaticEntities {
    let lower = |terms: Vec<String>| terms.into_iter().map(|t| t.to_lowercase()).collect();
    StaticEntities {
        insurance: lower(entities.insurance),
        metric: lower(entities.metric),
        operation: lower(entities.operation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_vocabulary_compiles() {
        let vocab = Vocabulary::embedded().unwrap();
        assert_eq!(vocab.intent_patterns.len(), 5);
        assert!(vocab.is_stop_word("the"));
        assert!(vocab.static_entities.insurance.contains(&"aetna".to_string()));
        assert!(!vocab.column_rules.is_empty());
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let raw = EMBEDDED_VOCABULARY.replace("\\\\bhow many\\\\b", "(unclosed");
        assert!(Vocabulary::from_json(&raw).is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        std::fs::write(&path, EMBEDDED_VOCABULARY).unwrap();
        assert!(Vocabulary::load(Some(&path)).is_ok());
        assert!(Vocabulary::load(Some(&dir.path().join("missing.json"))).is_err());
    }
}
