//! Construcción de la taxonomía a partir de los datos cargados: roles de
//! columna, entidades descubiertas e índice inverso término → entidad.
//!
//! Flujo:
//!   1. Clasificar cada columna (narrativa / identificador / métrica).
//!   2. Buscar entidades codificadas (`12-AETNA`) en las celdas narrativas.
//!   3. Generar alias (variantes de mayúsculas + grupos de sinónimos).
//!   4. Convertir los valores de la columna de rendimiento en entidades.
//!   5. Volcar todos los términos en el índice inverso.
//!
//! Se construye una vez por proceso; no hay actualización incremental.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::Serialize;

use crate::{
    ingest::LoadedCorpus,
    models::{CellValue, ColumnRole, Entity, EntityKind, Table},
    nlp::{contains_phrase, normalize},
    vocabulary::{RoleKeywords, Vocabulary},
};

const MIN_TERM_CHARS: usize = 3;

/// Clave de una entidad en el catálogo.
pub type EntityKey = (EntityKind, String);

/// Parámetros de construcción que vienen de la configuración.
#[derive(Debug, Clone)]
pub struct TaxonomySettings {
    pub coded_entity_pattern: Regex,
    pub performance_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Taxonomy {
    /// tabla → columna → rol
    pub column_roles: BTreeMap<String, BTreeMap<String, ColumnRole>>,
    /// Columnas narrativas distintas, en orden de aparición.
    pub narrative_columns: Vec<String>,
    pub performance_column: Option<String>,
    /// Todas las columnas distintas del corpus, en orden de aparición.
    pub known_columns: Vec<String>,
    pub entities: BTreeMap<EntityKey, Entity>,
    pub term_index: BTreeMap<String, Vec<EntityKey>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyStats {
    pub tables: usize,
    pub coded_entities: usize,
    pub performance_entities: usize,
    pub indexed_terms: usize,
    pub narrative_columns: Vec<String>,
    pub performance_column: Option<String>,
}

/// Rol de una columna por palabras clave sobre su nombre, evaluadas en el
/// orden narrativa → identificador → métrica. Sin coincidencia: métrica.
pub fn classify_column(name: &str, keywords: &RoleKeywords) -> ColumnRole {
    let normalized = normalize_column_name(name);
    let hit = |terms: &[String]| {
        terms
            .iter()
            .any(|kw| contains_phrase(&normalized, &normalize_column_name(kw)))
    };
    if hit(&keywords.narrative) {
        ColumnRole::Narrative
    } else if hit(&keywords.identifier) {
        ColumnRole::Identifier
    } else {
        // Con o sin palabra clave de métrica, la columna sigue siendo buscable.
        ColumnRole::Metric
    }
}

fn normalize_column_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

impl Taxonomy {
    pub fn build(corpus: &LoadedCorpus, vocabulary: &Vocabulary, settings: &TaxonomySettings) -> Self {
        let mut column_roles: BTreeMap<String, BTreeMap<String, ColumnRole>> = BTreeMap::new();
        let mut narrative_columns: Vec<String> = Vec::new();
        let mut known_columns: Vec<String> = Vec::new();
        let mut performance_column: Option<String> = None;
        let mut coded: BTreeMap<String, String> = BTreeMap::new();
        let mut performance_values: BTreeSet<String> = BTreeSet::new();

        for table in corpus.tables() {
            // 1) Roles
            let roles: BTreeMap<String, ColumnRole> = table
                .columns
                .iter()
                .map(|c| (c.clone(), classify_column(c, &vocabulary.role_keywords)))
                .collect();

            for column in &table.columns {
                push_unique(&mut known_columns, column.clone());
                if roles.get(column) == Some(&ColumnRole::Narrative) {
                    push_unique(&mut narrative_columns, column.clone());
                }
            }

            // 2) Entidades codificadas en celdas narrativas
            for (idx, column) in table.columns.iter().enumerate() {
                if roles.get(column) != Some(&ColumnRole::Narrative) {
                    continue;
                }
                for value in table.column_values(idx) {
                    if let CellValue::Text(text) = value {
                        collect_coded(&settings.coded_entity_pattern, text, &mut coded);
                    }
                }
            }

            // 4) Columna de rendimiento
            if let Some(idx) = find_performance_column(table, &roles, &settings.performance_column) {
                if performance_column.is_none() {
                    performance_column = Some(table.columns[idx].clone());
                }
                for value in table.column_values(idx) {
                    if !value.is_empty() {
                        performance_values.insert(value.to_string().trim().to_string());
                    }
                }
            }

            column_roles.insert(table.name.clone(), roles);
        }

        let mut entities: BTreeMap<EntityKey, Entity> = BTreeMap::new();

        // 3) Alias de entidades codificadas
        for (canonical, name) in coded {
            let entity = coded_entity(canonical, name, vocabulary);
            entities.insert((EntityKind::Coded, entity.canonical_form.clone()), entity);
        }
        for value in performance_values {
            let entity = performance_entity(value, vocabulary);
            entities.insert((EntityKind::Performance, entity.canonical_form.clone()), entity);
        }

        // 5) Índice inverso
        let mut term_index: BTreeMap<String, Vec<EntityKey>> = BTreeMap::new();
        for (key, entity) in &entities {
            let canonical = normalize(&entity.canonical_form);
            for term in entity.index_terms() {
                let term = normalize(term);
                if term.is_empty() || (term != canonical && !is_meaningful_term(&term, vocabulary)) {
                    continue;
                }
                let bucket = term_index.entry(term).or_default();
                if !bucket.contains(key) {
                    bucket.push(key.clone());
                }
            }
        }

        Self {
            column_roles,
            narrative_columns,
            performance_column,
            known_columns,
            entities,
            term_index,
        }
    }

    /// Entidades asociadas a un término normalizado.
    pub fn lookup(&self, term: &str) -> Vec<&Entity> {
        self.term_index
            .get(term)
            .map(|keys| keys.iter().filter_map(|k| self.entities.get(k)).collect())
            .unwrap_or_default()
    }

    pub fn role_of(&self, table: &str, column: &str) -> Option<ColumnRole> {
        self.column_roles.get(table)?.get(column).copied()
    }

    /// Nombre real de una columna conocida, sin distinguir mayúsculas.
    pub fn resolve_column(&self, column: &str) -> Option<&str> {
        let wanted = column.trim().to_lowercase();
        self.known_columns
            .iter()
            .find(|c| c.to_lowercase() == wanted)
            .map(String::as_str)
    }

    /// Columnas conocidas cuyo nombre contiene el fragmento dado.
    pub fn columns_containing(&self, fragment: &str) -> Vec<String> {
        let fragment = fragment.to_lowercase();
        self.known_columns
            .iter()
            .filter(|c| c.to_lowercase().contains(&fragment))
            .cloned()
            .collect()
    }

    pub fn entities_of(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities
            .iter()
            .filter(move |((k, _), _)| *k == kind)
            .map(|(_, e)| e)
    }

    pub fn stats(&self) -> TaxonomyStats {
        TaxonomyStats {
            tables: self.column_roles.len(),
            coded_entities: self.entities_of(EntityKind::Coded).count(),
            performance_entities: self.entities_of(EntityKind::Performance).count(),
            indexed_terms: self.term_index.len(),
            narrative_columns: self.narrative_columns.clone(),
            performance_column: self.performance_column.clone(),
        }
    }
}

fn collect_coded(pattern: &Regex, text: &str, found: &mut BTreeMap<String, String>) {
    for caps in pattern.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let canonical = whole.as_str().trim().to_string();
        if canonical.is_empty() {
            continue;
        }
        let name = caps
            .name("name")
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| match canonical.split_once('-') {
                Some((_, rest)) => rest.trim().to_string(),
                None => canonical.clone(),
            });
        found.entry(canonical).or_insert(name);
    }
}

/// Un término sirve para indexar o buscar si no es una palabra vacía y
/// tiene al menos `MIN_TERM_CHARS` caracteres.
pub fn is_meaningful_term(term: &str, vocabulary: &Vocabulary) -> bool {
    term.chars().count() >= MIN_TERM_CHARS && !vocabulary.is_stop_word(&term.to_lowercase())
}

fn coded_entity(canonical: String, name: String, vocabulary: &Vocabulary) -> Entity {
    let name_lower = name.to_lowercase();

    let mut search_terms = Vec::new();
    push_unique(&mut search_terms, canonical.to_lowercase());
    push_unique(&mut search_terms, name_lower.clone());

    let mut aliases = Vec::new();
    push_unique(&mut aliases, canonical.to_lowercase());
    push_unique(&mut aliases, name_lower.clone());
    push_unique(&mut aliases, title_case(&name));

    for group in &vocabulary.synonym_groups {
        let related = group.iter().any(|syn| {
            *syn == name_lower
                || (syn.len() >= 3 && name_lower.contains(syn.as_str()))
                || (name_lower.len() >= 3 && syn.contains(name_lower.as_str()))
        });
        if related {
            for syn in group {
                if *syn != name_lower {
                    push_unique(&mut aliases, syn.clone());
                }
            }
        }
    }

    Entity {
        kind: EntityKind::Coded,
        canonical_form: canonical,
        name,
        aliases,
        search_terms,
    }
}

/// Variantes de espaciado, guiones y tiempo verbal: `over performed`,
/// `over-performed`, `overperformed`, `over performing`...
fn spelling_variants(value: &str) -> Vec<String> {
    let base = normalize(value);
    let mut forms = vec![base.clone()];
    if let Some(stem) = base.strip_suffix("ed") {
        forms.push(format!("{stem}ing"));
    } else if let Some(stem) = base.strip_suffix("ing") {
        forms.push(format!("{stem}ed"));
    }

    let mut variants = Vec::new();
    for form in forms {
        push_unique(&mut variants, form.clone());
        push_unique(&mut variants, form.replace(' ', "-"));
        push_unique(&mut variants, form.replace([' ', '-'], ""));
    }
    variants
}

fn performance_entity(value: String, vocabulary: &Vocabulary) -> Entity {
    let search_terms = spelling_variants(&value);
    let lowered = normalize(&value);

    let mut aliases = Vec::new();
    for entry in &vocabulary.performance_synonyms {
        if contains_phrase(&lowered, &entry.matches.to_lowercase()) {
            for syn in &entry.synonyms {
                push_unique(&mut aliases, syn.to_lowercase());
            }
        }
    }

    Entity {
        kind: EntityKind::Performance,
        name: value.clone(),
        canonical_form: value,
        aliases,
        search_terms,
    }
}

fn find_performance_column(
    table: &Table,
    roles: &BTreeMap<String, ColumnRole>,
    configured: &str,
) -> Option<usize> {
    table.find_column(configured).or_else(|| {
        table.columns.iter().position(|c| {
            roles.get(c) == Some(&ColumnRole::Identifier) && c.to_lowercase().contains("performance")
        })
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ingest::LoadedCorpus;
    use crate::models::{DataSource, Row};

    pub(crate) fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    pub(crate) fn settings() -> TaxonomySettings {
        TaxonomySettings {
            coded_entity_pattern: Regex::new(crate::config::DEFAULT_CODED_ENTITY_PATTERN).unwrap(),
            performance_column: "Performance Diagnostic".to_string(),
        }
    }

    /// Corpus pequeño con el vocabulario del dominio de ingresos.
    pub(crate) fn revenue_corpus() -> LoadedCorpus {
        let table = Table::new(
            "weekly",
            "weekly.csv",
            vec![
                "Payer".into(),
                "Week".into(),
                "Operational - What Went Well".into(),
                "Revenue Cycle - What Can Be Improved".into(),
                "Performance Diagnostic".into(),
                "Over Performed".into(),
                "Payment Amount*".into(),
            ],
            vec![
                Row::new(vec![
                    text("Aetna"),
                    text("1"),
                    text("12-AETNA – improved collections"),
                    text("05-BLUE CROSS denials rising"),
                    text("Over Performed"),
                    text("1"),
                    text("100"),
                ]),
                Row::new(vec![
                    text("BCBS"),
                    text("2"),
                    text("05-BLUE CROSS faster posting"),
                    text("12-AETNA – slow appeals"),
                    text("Under Performed"),
                    text("0"),
                    text("250.5"),
                ]),
                Row::new(vec![
                    text("Aetna"),
                    text("3"),
                    text("12-AETNA – improved collections again"),
                    CellValue::Null,
                    text("Average Performance"),
                    text("0"),
                    text("bad"),
                ]),
            ],
        );
        LoadedCorpus::from_sources(
            vec![DataSource {
                name: "weekly.csv".into(),
                path: "weekly.csv".into(),
                tables: vec![table],
            }],
            100,
        )
    }

    pub(crate) fn revenue_taxonomy() -> Taxonomy {
        let vocab = Vocabulary::embedded().unwrap();
        Taxonomy::build(&revenue_corpus(), &vocab, &settings())
    }

    #[test]
    fn classifies_columns_in_priority_order() {
        let vocab = Vocabulary::embedded().unwrap();
        let kw = &vocab.role_keywords;
        assert_eq!(classify_column("Operational - What Went Well", kw), ColumnRole::Narrative);
        assert_eq!(classify_column("Performance Diagnostic", kw), ColumnRole::Identifier);
        assert_eq!(classify_column("Year of Visit Service Date", kw), ColumnRole::Identifier);
        assert_eq!(classify_column("Over Performed", kw), ColumnRole::Metric);
        assert_eq!(classify_column("Something Unusual", kw), ColumnRole::Metric);
    }

    #[test]
    fn discovers_coded_entities_from_narratives() {
        let taxonomy = revenue_taxonomy();
        let coded: Vec<&str> = taxonomy
            .entities_of(EntityKind::Coded)
            .map(|e| e.canonical_form.as_str())
            .collect();
        assert_eq!(coded, vec!["05-BLUE CROSS", "12-AETNA"]);

        let aetna = &taxonomy.entities[&(EntityKind::Coded, "12-AETNA".to_string())];
        assert_eq!(aetna.name, "AETNA");
        assert_eq!(aetna.search_terms, vec!["12-aetna", "aetna"]);
        assert!(aetna.aliases.contains(&"Aetna".to_string()));
    }

    #[test]
    fn synonym_groups_extend_aliases() {
        let taxonomy = revenue_taxonomy();
        let bcbs = &taxonomy.entities[&(EntityKind::Coded, "05-BLUE CROSS".to_string())];
        assert!(bcbs.aliases.contains(&"bcbs".to_string()));
        assert!(bcbs.aliases.contains(&"blue cross blue shield".to_string()));
        let hits = taxonomy.lookup("bcbs");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].canonical_form, "05-BLUE CROSS");
    }

    #[test]
    fn performance_values_become_entities() {
        let taxonomy = revenue_taxonomy();
        assert_eq!(taxonomy.performance_column.as_deref(), Some("Performance Diagnostic"));
        let over = &taxonomy.entities[&(EntityKind::Performance, "Over Performed".to_string())];
        for variant in ["over performed", "over-performed", "overperformed", "over performing"] {
            assert!(over.search_terms.contains(&variant.to_string()), "{variant}");
        }
        assert!(over.aliases.contains(&"outperformed".to_string()));
        assert_eq!(taxonomy.lookup("overperformed")[0].canonical_form, "Over Performed");
    }

    #[test]
    fn entity_without_aliases_keeps_itself_as_term() {
        let vocab = Vocabulary::embedded().unwrap();
        let entity = coded_entity("7-ZZQX".into(), "ZZQX".into(), &vocab);
        assert_eq!(entity.search_terms, vec!["7-zzqx", "zzqx"]);
        assert!(entity.aliases.iter().all(|a| a.to_lowercase().contains("zzqx")));
    }

    #[test]
    fn build_is_deterministic() {
        let vocab = Vocabulary::embedded().unwrap();
        let corpus = revenue_corpus();
        let first = Taxonomy::build(&corpus, &vocab, &settings());
        let second = Taxonomy::build(&corpus, &vocab, &settings());
        assert_eq!(first, second);
        assert_eq!(first.term_index, second.term_index);
    }

    #[test]
    fn duplicate_entities_across_tables_are_unioned() {
        let vocab = Vocabulary::embedded().unwrap();
        let mut corpus = revenue_corpus();
        let mut copy = corpus.sources[0].clone();
        copy.name = "copy.csv".into();
        copy.tables[0].name = "weekly copy".into();
        corpus = LoadedCorpus::from_sources(vec![corpus.sources.remove(0), copy], 100);
        let taxonomy = Taxonomy::build(&corpus, &vocab, &settings());
        assert_eq!(taxonomy.entities_of(EntityKind::Coded).count(), 2);
        assert_eq!(taxonomy.lookup("aetna").len(), 1);
        assert_eq!(taxonomy.column_roles.len(), 2);
    }

    /// Entidad codificada con nombre de una sola letra.
    pub(crate) fn short_code_corpus() -> LoadedCorpus {
        let table = Table::new(
            "notes",
            "notes.csv",
            vec!["Comments".into()],
            vec![
                Row::new(vec![text("3-A team posted faster")]),
                Row::new(vec![text("Cigna paid late")]),
                Row::new(vec![text("Humana paid")]),
            ],
        );
        LoadedCorpus::from_sources(
            vec![DataSource {
                name: "notes.csv".into(),
                path: "notes.csv".into(),
                tables: vec![table],
            }],
            100,
        )
    }

    #[test]
    fn short_names_stay_out_of_the_index() {
        let vocab = Vocabulary::embedded().unwrap();
        let taxonomy = Taxonomy::build(&short_code_corpus(), &vocab, &settings());
        let coded: Vec<&Entity> = taxonomy.entities_of(EntityKind::Coded).collect();
        assert_eq!(coded.len(), 1);
        assert_eq!(coded[0].canonical_form, "3-A");

        assert!(taxonomy.lookup("a").is_empty());
        assert_eq!(taxonomy.lookup("3-a").len(), 1);
        assert!(taxonomy
            .term_index
            .keys()
            .all(|term| term == "3-a" || is_meaningful_term(term, &vocab)));
    }

    #[test]
    fn meaningful_terms_need_length_and_content() {
        let vocab = Vocabulary::embedded().unwrap();
        assert!(!is_meaningful_term("a", &vocab));
        assert!(!is_meaningful_term("uh", &vocab));
        assert!(!is_meaningful_term("the", &vocab));
        assert!(!is_meaningful_term("Over", &vocab));
        assert!(is_meaningful_term("uhc", &vocab));
        assert!(is_meaningful_term("blue cross", &vocab));
    }
}
