//! Ejecución de búsquedas, recuentos y agregados sobre las tablas en
//! memoria a partir de una `ResolvedQuery`.

use std::{collections::BTreeSet, sync::Arc};

use serde::Serialize;

use crate::{
    error::AgentError,
    ingest::LoadedCorpus,
    models::{ColumnType, EntityKind, Table, TableSchema},
    resolver::ResolvedQuery,
    schema::{cell_number, is_truthy},
    taxonomy::Taxonomy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Search,
    Filter,
    Count,
    Aggregate,
}

impl Operation {
    pub const ALL: [&'static str; 4] = ["search", "filter", "count", "aggregate"];

    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "search" => Some(Operation::Search),
            "filter" => Some(Operation::Filter),
            "count" => Some(Operation::Count),
            "aggregate" => Some(Operation::Aggregate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedRow {
    pub row_index: usize,
    pub matched_columns: Vec<String>,
    pub values: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMatches {
    pub table: String,
    pub source: String,
    pub total_matches: usize,
    pub rows: Vec<MatchedRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub total_matches: usize,
    pub search_terms: Vec<String>,
    pub target_columns: Vec<String>,
    pub tables: Vec<TableMatches>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountMethod {
    /// Columna indicadora o texto de diagnóstico.
    Flag,
    /// Sin patrón reconocido: total de la búsqueda.
    Search,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableCount {
    pub table: String,
    pub count: usize,
    pub flag_column: Option<String>,
    pub diagnostic_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountOutcome {
    pub count: usize,
    pub method: CountMethod,
    pub categories: Vec<String>,
    pub tables: Vec<TableCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub column: String,
    pub count: usize,
    pub sum: f64,
    pub average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableAggregates {
    pub table: String,
    pub row_count: usize,
    pub columns: Vec<ColumnStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateOutcome {
    pub tables: Vec<TableAggregates>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum QueryOutcome {
    Search(SearchOutcome),
    Filter(SearchOutcome),
    Count(CountOutcome),
    Aggregate(AggregateOutcome),
}

impl QueryOutcome {
    pub fn operation(&self) -> Operation {
        match self {
            QueryOutcome::Search(_) => Operation::Search,
            QueryOutcome::Filter(_) => Operation::Filter,
            QueryOutcome::Count(_) => Operation::Count,
            QueryOutcome::Aggregate(_) => Operation::Aggregate,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            QueryOutcome::Search(s) | QueryOutcome::Filter(s) => s.total_matches == 0,
            QueryOutcome::Count(c) => c.count == 0 && c.tables.is_empty(),
            QueryOutcome::Aggregate(a) => a.tables.iter().all(|t| t.columns.is_empty()),
        }
    }
}

/// Ejecutor de consultas sobre el corpus cargado en el arranque.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    corpus: Arc<LoadedCorpus>,
    taxonomy: Arc<Taxonomy>,
    result_limit: usize,
}

impl QueryExecutor {
    pub fn new(corpus: Arc<LoadedCorpus>, taxonomy: Arc<Taxonomy>, result_limit: usize) -> Self {
        Self {
            corpus,
            taxonomy,
            result_limit,
        }
    }

    pub fn corpus(&self) -> &LoadedCorpus {
        &self.corpus
    }

    pub fn execute(&self, action: &str, resolved: &ResolvedQuery) -> Result<QueryOutcome, AgentError> {
        let operation = Operation::parse(action).ok_or_else(|| AgentError::UnsupportedAction {
            agent: "query".to_string(),
            action: action.to_string(),
        })?;
        Ok(match operation {
            Operation::Search => QueryOutcome::Search(self.search(resolved)),
            Operation::Filter => QueryOutcome::Filter(self.search(resolved)),
            Operation::Count => QueryOutcome::Count(self.count(resolved)),
            Operation::Aggregate => QueryOutcome::Aggregate(self.aggregate(resolved)),
        })
    }

    /// Filas de `table` que casan con la consulta, con las columnas que
    /// provocaron la coincidencia.
    pub fn matching_rows(&self, table: &Table, search_terms: &[String], target_columns: &[String]) -> Vec<(usize, Vec<usize>)> {
        let candidates: Vec<usize> = if target_columns.is_empty() {
            (0..table.columns.len()).collect()
        } else {
            target_columns.iter().filter_map(|c| table.find_column(c)).collect()
        };
        if candidates.is_empty() || (search_terms.is_empty() && target_columns.is_empty()) {
            return Vec::new();
        }
        let terms: Vec<String> = search_terms.iter().map(|t| t.to_lowercase()).collect();

        table
            .rows
            .iter()
            .enumerate()
            .filter_map(|(row_index, row)| {
                let matched: Vec<usize> = candidates
                    .iter()
                    .copied()
                    .filter(|idx| match row.get(*idx) {
                        None => false,
                        Some(value) if value.is_empty() => false,
                        Some(_) if terms.is_empty() => true,
                        Some(value) => {
                            let text = value.to_string().to_lowercase();
                            terms.iter().any(|t| text.contains(t.as_str()))
                        }
                    })
                    .collect();
                (!matched.is_empty()).then_some((row_index, matched))
            })
            .collect()
    }

    pub fn search(&self, resolved: &ResolvedQuery) -> SearchOutcome {
        self.search_terms(&resolved.search_terms, &resolved.target_columns)
    }

    pub fn search_terms(&self, search_terms: &[String], target_columns: &[String]) -> SearchOutcome {
        let mut tables = Vec::new();
        let mut total_matches = 0;

        for table in self.corpus.tables() {
            let matches = self.matching_rows(table, search_terms, target_columns);
            if matches.is_empty() {
                continue;
            }
            total_matches += matches.len();
            let rows = matches
                .iter()
                .take(self.result_limit)
                .map(|(row_index, columns)| MatchedRow {
                    row_index: *row_index,
                    matched_columns: columns.iter().map(|c| table.columns[*c].clone()).collect(),
                    values: table.row_to_json(&table.rows[*row_index]),
                })
                .collect();
            tables.push(TableMatches {
                table: table.name.clone(),
                source: table.source.clone(),
                total_matches: matches.len(),
                rows,
            });
        }

        SearchOutcome {
            total_matches,
            search_terms: search_terms.to_vec(),
            target_columns: target_columns.to_vec(),
            tables,
        }
    }

    /// Recuento por categoría de rendimiento: una fila cuenta si su columna
    /// indicadora está activa O si el texto de diagnóstico contiene algún
    /// sinónimo de la categoría. Sin categoría reconocida se usa el total de
    /// la búsqueda.
    pub fn count(&self, resolved: &ResolvedQuery) -> CountOutcome {
        let categories: Vec<_> = resolved.entities_of(EntityKind::Performance).collect();
        if categories.is_empty() {
            let search = self.search(resolved);
            return CountOutcome {
                count: search.total_matches,
                method: CountMethod::Search,
                categories: Vec::new(),
                tables: search
                    .tables
                    .iter()
                    .map(|t| TableCount {
                        table: t.table.clone(),
                        count: t.total_matches,
                        flag_column: None,
                        diagnostic_column: None,
                    })
                    .collect(),
            };
        }

        let coded_terms: Vec<String> = resolved
            .entities_of(EntityKind::Coded)
            .flat_map(|e| {
                std::iter::once(e.resolved_value.to_lowercase()).chain(e.entity.search_terms.iter().cloned())
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let synonyms: Vec<(String, Vec<String>)> = categories
            .iter()
            .map(|c| {
                let terms = c
                    .entity
                    .index_terms()
                    .map(|t| t.to_lowercase())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                (c.resolved_value.clone(), terms)
            })
            .collect();

        let mut tables = Vec::new();
        let mut count = 0;
        for table in self.corpus.tables() {
            let diagnostic = self
                .taxonomy
                .performance_column
                .as_deref()
                .and_then(|c| table.find_column(c));
            let flags: Vec<Option<usize>> = synonyms
                .iter()
                .map(|(category, _)| table.find_column(category))
                .collect();
            if diagnostic.is_none() && flags.iter().all(Option::is_none) {
                continue;
            }

            let mut table_count = 0;
            for row in &table.rows {
                if !coded_terms.is_empty() {
                    let mentions = row.values.iter().any(|v| {
                        let text = v.to_string().to_lowercase();
                        coded_terms.iter().any(|t| text.contains(t.as_str()))
                    });
                    if !mentions {
                        continue;
                    }
                }
                let diagnostic_text = diagnostic
                    .and_then(|idx| row.get(idx))
                    .map(|v| v.to_string().to_lowercase())
                    .unwrap_or_default();
                let hit = synonyms.iter().zip(&flags).any(|((_, terms), flag)| {
                    let flagged = flag.and_then(|idx| row.get(idx)).is_some_and(is_truthy);
                    flagged || terms.iter().any(|t| diagnostic_text.contains(t.as_str()))
                });
                if hit {
                    table_count += 1;
                }
            }

            count += table_count;
            tables.push(TableCount {
                table: table.name.clone(),
                count: table_count,
                flag_column: flags.iter().flatten().next().map(|idx| table.columns[*idx].clone()),
                diagnostic_column: diagnostic.map(|idx| table.columns[idx].clone()),
            });
        }

        CountOutcome {
            count,
            method: CountMethod::Flag,
            categories: synonyms.into_iter().map(|(c, _)| c).collect(),
            tables,
        }
    }

    /// count / sum / average / min / max de cada columna numérica. Las celdas
    /// no numéricas se excluyen del agregado.
    pub fn aggregate(&self, resolved: &ResolvedQuery) -> AggregateOutcome {
        let is_numeric = |schema: &TableSchema, column: &str| {
            schema
                .profile(column)
                .is_some_and(|p| p.column_type == ColumnType::Number)
        };
        // Solo se restringe si alguna columna objetivo es numérica en el corpus.
        let restrict = resolved
            .target_columns
            .iter()
            .any(|c| self.corpus.schemas.values().any(|s| is_numeric(s, c.as_str())));

        let mut tables = Vec::new();
        for table in self.corpus.tables() {
            let Some(schema) = self.corpus.schema(&table.name) else {
                continue;
            };
            let numeric_targets: Vec<&String> = resolved
                .target_columns
                .iter()
                .filter(|c| is_numeric(schema, c.as_str()))
                .collect();

            let columns: Vec<ColumnStats> = schema
                .columns
                .iter()
                .filter(|p| p.column_type == ColumnType::Number)
                .filter(|p| !restrict || numeric_targets.contains(&&p.name))
                .filter_map(|p| table.column_index(&p.name).map(|idx| column_stats(table, idx)))
                .collect();

            if !columns.is_empty() {
                tables.push(TableAggregates {
                    table: table.name.clone(),
                    row_count: table.rows.len(),
                    columns,
                });
            }
        }
        AggregateOutcome { tables }
    }
}

fn column_stats(table: &Table, index: usize) -> ColumnStats {
    let values: Vec<f64> = table.column_values(index).filter_map(cell_number).collect();
    let sum: f64 = values.iter().sum();
    let count = values.len();
    ColumnStats {
        column: table.columns[index].clone(),
        count,
        sum,
        average: (count > 0).then(|| sum / count as f64),
        min: values.iter().copied().reduce(f64::min),
        max: values.iter().copied().reduce(f64::max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CellValue, DataSource, Row};
    use crate::nlp::QueryProcessor;
    use crate::resolver::EntityResolver;
    use crate::taxonomy::tests::{revenue_corpus, settings, short_code_corpus, text};
    use crate::vocabulary::Vocabulary;

    fn executor_for(corpus: LoadedCorpus) -> (QueryExecutor, Arc<Taxonomy>) {
        let vocab = Vocabulary::embedded().unwrap();
        let taxonomy = Arc::new(Taxonomy::build(&corpus, &vocab, &settings()));
        (QueryExecutor::new(Arc::new(corpus), taxonomy.clone(), 50), taxonomy)
    }

    fn resolve(taxonomy: &Taxonomy, query: &str) -> ResolvedQuery {
        let vocab = Vocabulary::embedded().unwrap();
        let nlp = QueryProcessor::new(&vocab).process(query);
        EntityResolver::new(taxonomy, &vocab).resolve(query, &nlp)
    }

    fn single_table(name: &str, headers: &[&str], rows: Vec<Vec<CellValue>>) -> LoadedCorpus {
        let table = Table::new(
            name,
            format!("{name}.csv"),
            headers.iter().map(|h| h.to_string()).collect(),
            rows.into_iter().map(Row::new).collect(),
        );
        LoadedCorpus::from_sources(
            vec![DataSource {
                name: format!("{name}.csv"),
                path: format!("{name}.csv").into(),
                tables: vec![table],
            }],
            100,
        )
    }

    #[test]
    fn search_restricts_to_target_columns() {
        let (executor, taxonomy) = executor_for(revenue_corpus());
        let resolved = resolve(&taxonomy, "what went well operationally for aetna");
        let QueryOutcome::Search(outcome) = executor.execute("search", &resolved).unwrap() else {
            panic!("se esperaba una búsqueda");
        };
        // la fila 2 menciona a AETNA solo en la columna "can be improved"
        assert_eq!(outcome.total_matches, 2);
        let rows: Vec<usize> = outcome.tables[0].rows.iter().map(|r| r.row_index).collect();
        assert_eq!(rows, vec![0, 2]);
        assert_eq!(outcome.tables[0].rows[0].matched_columns, vec!["Operational - What Went Well"]);
    }

    #[test]
    fn search_caps_payload_but_reports_total() {
        let rows = (0..80).map(|i| vec![text(&format!("12-AETNA note {i}"))]).collect();
        let (executor, taxonomy) = executor_for(single_table("notes", &["Comments"], rows));
        let resolved = resolve(&taxonomy, "show me aetna");
        let outcome = executor.search(&resolved);
        assert_eq!(outcome.total_matches, 80);
        assert_eq!(outcome.tables[0].total_matches, 80);
        assert_eq!(outcome.tables[0].rows.len(), 50);
    }

    #[test]
    fn unknown_terms_return_empty_well_formed_result() {
        let (executor, taxonomy) = executor_for(revenue_corpus());
        let resolved = resolve(&taxonomy, "zebra xylophone");
        assert!(resolved.used_fallback);
        let outcome = executor.execute("search", &resolved).unwrap();
        assert!(outcome.is_empty());
        assert_eq!(outcome.operation(), Operation::Search);
    }

    #[test]
    fn count_uses_flag_or_diagnostic_text() {
        let mut rows = Vec::new();
        for _ in 0..4 {
            rows.push(vec![CellValue::Number(1.0), text("Average Performance")]);
        }
        for _ in 0..2 {
            rows.push(vec![CellValue::Number(0.0), text("Over Performed")]);
        }
        for _ in 0..4 {
            rows.push(vec![CellValue::Number(0.0), text("Under Performed")]);
        }
        let corpus = single_table("perf", &["Over Performed", "Performance Diagnostic"], rows);
        let (executor, taxonomy) = executor_for(corpus);

        let resolved = resolve(&taxonomy, "how many over performed");
        let QueryOutcome::Count(outcome) = executor.execute("count", &resolved).unwrap() else {
            panic!("se esperaba un recuento");
        };
        assert_eq!(outcome.method, CountMethod::Flag);
        assert_eq!(outcome.count, 6);
        assert_eq!(outcome.categories, vec!["Over Performed"]);
        assert_eq!(outcome.tables[0].flag_column.as_deref(), Some("Over Performed"));
    }

    #[test]
    fn count_without_category_falls_back_to_search_total() {
        let (executor, taxonomy) = executor_for(revenue_corpus());
        let resolved = resolve(&taxonomy, "how many mention aetna");
        let QueryOutcome::Count(outcome) = executor.execute("count", &resolved).unwrap() else {
            panic!("se esperaba un recuento");
        };
        assert_eq!(outcome.method, CountMethod::Search);
        assert_eq!(outcome.count, 3);
    }

    #[test]
    fn count_restricts_to_mentioned_coded_entities() {
        let (executor, taxonomy) = executor_for(revenue_corpus());
        let resolved = resolve(&taxonomy, "how many aetna over performed");
        let outcome = executor.count(&resolved);
        assert_eq!(outcome.method, CountMethod::Flag);
        assert_eq!(outcome.count, 1);
    }

    #[test]
    fn aggregate_skips_unparseable_cells() {
        let rows = vec![
            vec![text("10")],
            vec![text("20")],
            vec![text("bad")],
            vec![text("30")],
        ];
        let (executor, taxonomy) = executor_for(single_table("payments", &["Payment Amount*"], rows));
        let resolved = resolve(&taxonomy, "total payment amount");
        let QueryOutcome::Aggregate(outcome) = executor.execute("aggregate", &resolved).unwrap() else {
            panic!("se esperaba un agregado");
        };
        let stats = &outcome.tables[0].columns[0];
        assert_eq!(stats.count, 3);
        assert!((stats.sum - 60.0).abs() < 1e-9);
        assert_eq!(stats.average, Some(20.0));
        assert_eq!(stats.min, Some(10.0));
        assert_eq!(stats.max, Some(30.0));
    }

    #[test]
    fn unsupported_action_is_an_error() {
        let (executor, taxonomy) = executor_for(revenue_corpus());
        let resolved = resolve(&taxonomy, "show me aetna");
        let err = executor.execute("delete", &resolved).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_ACTION");
    }

    #[test]
    fn articles_do_not_match_single_letter_names() {
        let (executor, taxonomy) = executor_for(short_code_corpus());

        let resolved = resolve(&taxonomy, "show me a cigna summary");
        assert!(resolved.resolved_entities.is_empty());
        assert!(!resolved.search_terms.iter().any(|t| t == "a"));
        let outcome = executor.search(&resolved);
        assert_eq!(outcome.total_matches, 1);
        assert_eq!(outcome.tables[0].rows[0].row_index, 1);

        let resolved = resolve(&taxonomy, "is there a delay");
        assert!(resolved.resolved_entities.is_empty());
        assert!(executor.execute("search", &resolved).unwrap().is_empty());

        let resolved = resolve(&taxonomy, "show me 3-a");
        assert_eq!(resolved.resolved_entities[0].resolved_value, "3-A");
        assert_eq!(resolved.search_terms, vec!["3-A"]);
        assert_eq!(executor.search(&resolved).total_matches, 1);
    }
}
