//! Resolución de entidades contra la taxonomía: conecta el vocabulario del
//! usuario con los valores literales de los datos y decide qué columnas
//! y términos usar en la ejecución.

use serde::Serialize;
use tracing::debug;

use crate::{
    intent::Intent,
    models::{Entity, EntityKind},
    nlp::{contains_phrase, normalize, NlpResult},
    taxonomy::{is_meaningful_term, Taxonomy},
    vocabulary::Vocabulary,
};

const MAX_WINDOW: usize = 3;
const MAX_SECONDARY_ALIASES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedEntity {
    pub user_term: String,
    pub kind: EntityKind,
    /// Forma canónica de la entidad, tal y como aparece en los datos.
    pub resolved_value: String,
    pub entity: Entity,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedQuery {
    pub original_query: String,
    pub normalized_query: String,
    pub intent: Intent,
    pub resolved_entities: Vec<ResolvedEntity>,
    pub target_columns: Vec<String>,
    pub search_terms: Vec<String>,
    /// Sin entidades ni columnas: el ejecutor busca en todas las columnas.
    pub used_fallback: bool,
    pub confidence: f64,
}

impl ResolvedQuery {
    pub fn entities_of(&self, kind: EntityKind) -> impl Iterator<Item = &ResolvedEntity> {
        self.resolved_entities.iter().filter(move |e| e.kind == kind)
    }
}

pub struct EntityResolver<'a> {
    taxonomy: &'a Taxonomy,
    vocabulary: &'a Vocabulary,
}

impl<'a> EntityResolver<'a> {
    pub fn new(taxonomy: &'a Taxonomy, vocabulary: &'a Vocabulary) -> Self {
        Self { taxonomy, vocabulary }
    }

    pub fn resolve(&self, query: &str, nlp: &NlpResult) -> ResolvedQuery {
        let entities = self.resolve_entities(&nlp.normalized_query);
        let target_columns = self.target_columns(&nlp.normalized_query, &entities);
        let search_terms = if !entities.is_empty() {
            assemble_search_terms(&entities, self.vocabulary)
        } else if target_columns.is_empty() {
            nlp.search_terms.clone()
        } else {
            // Columnas sin entidades: se listan los valores de esas columnas.
            Vec::new()
        };

        let mut confidence: f64 = 0.3;
        if !entities.is_empty() {
            let average = entities.iter().map(|e| e.confidence).sum::<f64>() / entities.len() as f64;
            confidence += 0.3 + 0.2 * average;
        }
        if !target_columns.is_empty() {
            confidence += 0.2;
        }
        if !search_terms.is_empty() {
            confidence += 0.1;
        }

        let used_fallback = entities.is_empty() && target_columns.is_empty();
        debug!(
            entities = entities.len(),
            columns = target_columns.len(),
            terms = search_terms.len(),
            used_fallback,
            "Consulta resuelta"
        );

        ResolvedQuery {
            original_query: query.to_string(),
            normalized_query: nlp.normalized_query.clone(),
            intent: nlp.intent,
            resolved_entities: entities,
            target_columns,
            search_terms,
            used_fallback,
            confidence: confidence.min(1.0),
        }
    }

    /// Ventanas de 1, 2 y 3 palabras buscadas en el índice inverso.
    fn resolve_entities(&self, normalized: &str) -> Vec<ResolvedEntity> {
        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        let mut resolved: Vec<ResolvedEntity> = Vec::new();

        for start in 0..tokens.len() {
            for size in 1..=MAX_WINDOW {
                if start + size > tokens.len() {
                    break;
                }
                let window = tokens[start..start + size].join(" ");
                for entity in self.taxonomy.lookup(&window) {
                    let mut confidence = 0.5;
                    if entity.search_terms.iter().any(|t| *t == window) {
                        confidence += 0.3;
                    }
                    if entity.canonical_form.to_lowercase().contains(&window) {
                        confidence += 0.2;
                    }
                    let confidence = f64::min(confidence, 1.0);

                    match resolved
                        .iter_mut()
                        .find(|r| r.kind == entity.kind && r.resolved_value == entity.canonical_form)
                    {
                        Some(existing) if confidence > existing.confidence => {
                            existing.confidence = confidence;
                            existing.user_term = window.clone();
                        }
                        Some(_) => {}
                        None => resolved.push(ResolvedEntity {
                            user_term: window.clone(),
                            kind: entity.kind,
                            resolved_value: entity.canonical_form.clone(),
                            entity: entity.clone(),
                            confidence,
                        }),
                    }
                }
            }
        }
        resolved
    }

    /// Alias directos, después reglas por patrón y, si nada encaja,
    /// inferencia a partir de las entidades resueltas.
    fn target_columns(&self, normalized: &str, entities: &[ResolvedEntity]) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        let add = |column: String, columns: &mut Vec<String>| {
            if !columns.contains(&column) {
                columns.push(column);
            }
        };

        for alias in &self.vocabulary.column_aliases {
            if contains_phrase(normalized, &normalize(&alias.phrase)) {
                for column in &alias.columns {
                    if let Some(real) = self.taxonomy.resolve_column(column) {
                        add(real.to_string(), &mut columns);
                    }
                }
            }
        }

        if columns.is_empty() {
            for rule in &self.vocabulary.column_rules {
                if rule.pattern.is_match(normalized) {
                    for column in self.taxonomy.columns_containing(&rule.column_contains) {
                        add(column, &mut columns);
                    }
                }
            }
        }

        if columns.is_empty() {
            if entities.iter().any(|e| e.kind == EntityKind::Coded) {
                for column in &self.taxonomy.narrative_columns {
                    add(column.clone(), &mut columns);
                }
            }
            if entities.iter().any(|e| e.kind == EntityKind::Performance) {
                if let Some(column) = &self.taxonomy.performance_column {
                    add(column.clone(), &mut columns);
                }
            }
        }

        columns
    }
}

/// Valores canónicos primero y después hasta tres alias por entidad, sin
/// repetir (sin distinguir mayúsculas) y sin alias cortos ni palabras vacías.
fn assemble_search_terms(entities: &[ResolvedEntity], vocabulary: &Vocabulary) -> Vec<String> {
    let mut primary: Vec<String> = Vec::new();
    let mut secondary: Vec<String> = Vec::new();
    let seen = |list: &[String], other: &[String], term: &str| {
        list.iter().chain(other.iter()).any(|t| t.eq_ignore_ascii_case(term))
    };

    for resolved in entities {
        if !seen(&primary, &secondary, &resolved.resolved_value) {
            primary.push(resolved.resolved_value.clone());
        }
    }
    for resolved in entities {
        let mut taken = 0;
        for alias in &resolved.entity.aliases {
            if taken == MAX_SECONDARY_ALIASES {
                break;
            }
            if is_meaningful_term(alias, vocabulary) && !seen(&primary, &secondary, alias) {
                secondary.push(alias.clone());
                taken += 1;
            }
        }
    }

    primary.extend(secondary);
    primary
}
