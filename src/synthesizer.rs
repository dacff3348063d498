//! Redacción de la respuesta final a partir de los resultados tipados de
//! los pasos. Función pura: nunca falla y, sin resultados, devuelve el
//! mensaje genérico de "sin resultados".

use std::collections::HashMap;

use regex::Regex;

use crate::{
    agents::{AnalysisOutcome, QueryStep, StepOutputs},
    executor::{AggregateOutcome, CountMethod, CountOutcome, QueryOutcome, SearchOutcome},
    models::EntityKind,
};

const MAX_AGGREGATE_COLUMNS: usize = 8;
const MAX_BULLETS: usize = 5;
const MAX_SAMPLES: usize = 3;
const SNIPPET_CHARS: usize = 160;

/// Palabras de relleno que no cuentan como patrón.
const FILLER_WORDS: &[&str] = &[
    "about", "after", "again", "also", "been", "being", "from", "have", "into", "more", "most",
    "over", "same", "some", "than", "that", "their", "there", "these", "this", "very", "were",
    "what", "when", "which", "while", "with", "week", "weeks",
];

pub fn synthesize(outputs: &StepOutputs, original_query: &str) -> String {
    if let (Some(analysis), Some(step)) = (&outputs.analysis, &outputs.query) {
        return match analysis {
            AnalysisOutcome::Compare { entities } if entities.iter().any(|e| e.total_matches > 0) => {
                compare_answer(analysis)
            }
            AnalysisOutcome::Compare { .. } => no_results(original_query),
            AnalysisOutcome::Analyze { distributions, .. } if !distributions.is_empty() => {
                analyze_answer(analysis)
            }
            _ => query_answer(step, original_query),
        };
    }

    match &outputs.query {
        Some(step) => query_answer(step, original_query),
        None => no_results(original_query),
    }
}

fn no_results(query: &str) -> String {
    format!(
        "No he encontrado resultados para \"{}\". Prueba a nombrar un pagador, una categoría de rendimiento o una columna.",
        query.trim()
    )
}

fn query_answer(step: &QueryStep, query: &str) -> String {
    if step.outcome.is_empty() {
        return no_results(query);
    }
    match &step.outcome {
        QueryOutcome::Count(count) => count_answer(step, count),
        QueryOutcome::Search(search) => {
            category_answer(step, search).unwrap_or_else(|| search_answer(search, "Resultados"))
        }
        QueryOutcome::Filter(search) => search_answer(search, "Filtrado"),
        QueryOutcome::Aggregate(aggregate) => aggregate_answer(aggregate),
    }
}

fn plural(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{count} {singular}")
    } else {
        format!("{count} {plural}")
    }
}

fn matching_records(count: usize) -> String {
    plural(count, "registro coincidente", "registros coincidentes")
}

fn coded_names(step: &QueryStep) -> Vec<&str> {
    step.resolved
        .entities_of(EntityKind::Coded)
        .map(|e| e.resolved_value.as_str())
        .collect()
}

fn count_answer(step: &QueryStep, count: &CountOutcome) -> String {
    let mut answer = match count.method {
        CountMethod::Flag => {
            let entities = coded_names(step);
            let scope = if entities.is_empty() {
                String::new()
            } else {
                format!(" para {}", entities.join(", "))
            };
            format!(
                "Hay {} como {}{}.",
                plural(count.count, "registro clasificado", "registros clasificados"),
                count.categories.join(" o "),
                scope
            )
        }
        CountMethod::Search => format!(
            "Resultados: {} con {}.",
            matching_records(count.count),
            describe_terms(&step.resolved.search_terms, &step.resolved.target_columns)
        ),
    };

    let with_rows: Vec<_> = count.tables.iter().filter(|t| t.count > 0).collect();
    if with_rows.len() > 1 {
        let breakdown: Vec<String> = with_rows
            .iter()
            .map(|t| format!("{}: {}", t.table, t.count))
            .collect();
        answer.push_str(&format!(" Desglose: {}.", breakdown.join(", ")));
    }
    answer
}

fn describe_terms(terms: &[String], columns: &[String]) -> String {
    match (terms.first(), columns.is_empty()) {
        (Some(term), _) => format!("\"{term}\""),
        (None, false) => format!("entradas en {}", columns.join(", ")),
        (None, true) => "tu pregunta".to_string(),
    }
}

fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= SNIPPET_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(SNIPPET_CHARS).collect();
        format!("{}...", cut.trim_end())
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn search_answer(search: &SearchOutcome, verb: &str) -> String {
    let mut lines = vec![format!(
        "{verb}: {} con {} en {}.",
        matching_records(search.total_matches),
        describe_terms(&search.search_terms, &search.target_columns),
        plural(search.tables.len(), "tabla", "tablas")
    )];

    let mut shown = 0;
    for table in &search.tables {
        lines.push(format!("- {}: {}", table.table, plural(table.total_matches, "registro", "registros")));
        for row in table.rows.iter().take(MAX_SAMPLES.saturating_sub(shown)) {
            let cells: Vec<String> = row
                .matched_columns
                .iter()
                .filter_map(|c| row.values.get(c).map(|v| format!("{c}: {}", snippet(&value_text(v)))))
                .collect();
            if !cells.is_empty() {
                lines.push(format!("  • {}", cells.join(" | ")));
                shown += 1;
            }
        }
    }

    let payload: usize = search.tables.iter().map(|t| t.rows.len()).sum();
    if payload < search.total_matches {
        lines.push(format!("Se muestran los primeros {payload} registros de {}.", search.total_matches));
    }
    lines.join("\n")
}

/// Plantilla "qué fue bien / qué se puede mejorar" para una entidad
/// codificada. Devuelve `None` si la búsqueda no encaja en la plantilla.
fn category_answer(step: &QueryStep, search: &SearchOutcome) -> Option<String> {
    let entities = coded_names(step);
    let entity = *entities.first()?;

    let category = |column: &str| {
        let lower = column.to_lowercase();
        if lower.contains("went well") {
            Some("fue bien")
        } else if lower.contains("can be improved") {
            Some("se puede mejorar")
        } else {
            None
        }
    };
    let label = step.resolved.target_columns.iter().try_fold(None, |label, column| {
        match (label, category(column.as_str())) {
            (_, None) => Err(()),
            (None, Some(c)) => Ok(Some(c)),
            (Some(prev), Some(c)) if prev == c => Ok(Some(c)),
            _ => Err(()),
        }
    });
    let label = label.ok().flatten()?;

    let prefix = Regex::new(&format!("(?i){}", regex::escape(entity))).ok()?;
    let mut fragments: Vec<String> = Vec::new();
    for table in &search.tables {
        for row in &table.rows {
            for column in &row.matched_columns {
                let Some(value) = row.values.get(column) else { continue };
                let text = value_text(value);
                for line in text.lines().filter(|l| prefix.is_match(l) || !text.contains('\n')) {
                    let cleaned = prefix
                        .replace_all(line, "")
                        .trim_matches(|c: char| c.is_whitespace() || "-–—:,;.".contains(c))
                        .to_string();
                    if !cleaned.is_empty() && !fragments.iter().any(|f| f.eq_ignore_ascii_case(&cleaned)) {
                        fragments.push(cleaned);
                    }
                }
            }
        }
    }
    if fragments.is_empty() {
        return None;
    }

    let mut lines = vec![format!(
        "Esto es lo que {label} para {entity} ({}):",
        matching_records(search.total_matches)
    )];
    lines.extend(fragments.iter().take(MAX_BULLETS).map(|f| format!("• {}", snippet(f))));
    if fragments.len() > MAX_BULLETS {
        lines.push(format!("...y {} más.", fragments.len() - MAX_BULLETS));
    }
    if let Some(word) = most_frequent_word(&fragments, entity) {
        lines.push(format!("Patrón más frecuente: \"{word}\""));
    }
    Some(lines.join("\n"))
}

/// Palabra con contenido más repetida. Empates: la alfabéticamente menor.
fn most_frequent_word(fragments: &[String], entity: &str) -> Option<String> {
    let entity_words: Vec<String> = entity
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_string)
        .collect();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for fragment in fragments {
        for word in fragment
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= 4 && w.chars().all(char::is_alphabetic))
        {
            if FILLER_WORDS.iter().any(|f| *f == word) || entity_words.iter().any(|e| e == word) {
                continue;
            }
            *counts.entry(word.to_string()).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(word, _)| word)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}

fn aggregate_answer(aggregate: &AggregateOutcome) -> String {
    let mut lines = vec!["Resúmenes numéricos:".to_string()];
    let mut shown = 0;
    for table in &aggregate.tables {
        for stats in &table.columns {
            if shown == MAX_AGGREGATE_COLUMNS {
                break;
            }
            let optional = |v: Option<f64>| v.map(format_number).unwrap_or_else(|| "n/d".to_string());
            lines.push(format!(
                "- {} ({}): total {}, media {}, mínimo {}, máximo {} sobre {}",
                stats.column,
                table.table,
                format_number(stats.sum),
                optional(stats.average),
                optional(stats.min),
                optional(stats.max),
                plural(stats.count, "valor", "valores")
            ));
            shown += 1;
        }
    }
    let total: usize = aggregate.tables.iter().map(|t| t.columns.len()).sum();
    if total > shown {
        lines.push(format!("...y {} columnas numéricas más.", total - shown));
    }
    lines.join("\n")
}

fn compare_answer(analysis: &AnalysisOutcome) -> String {
    let AnalysisOutcome::Compare { entities } = analysis else {
        return String::new();
    };
    let mut lines = vec![format!("Comparación entre {}:", plural(entities.len(), "entidad", "entidades"))];
    for entity in entities {
        lines.push(format!(
            "- {}: {}",
            entity.entity,
            plural(entity.total_matches, "registro", "registros")
        ));
    }
    let mut ranked: Vec<_> = entities.iter().collect();
    ranked.sort_by(|a, b| b.total_matches.cmp(&a.total_matches).then_with(|| a.entity.cmp(&b.entity)));
    match ranked.as_slice() {
        [first, second, ..] if first.total_matches == second.total_matches => {
            lines.push("Aparecen con la misma frecuencia.".to_string())
        }
        [first, ..] => lines.push(format!("{} es la que más aparece.", first.entity)),
        [] => {}
    }
    lines.join("\n")
}

fn analyze_answer(analysis: &AnalysisOutcome) -> String {
    let AnalysisOutcome::Analyze {
        rows_analyzed,
        distributions,
    } = analysis
    else {
        return String::new();
    };
    let mut lines = vec![format!("Registros analizados: {rows_analyzed}.")];
    for distribution in distributions {
        let values: Vec<String> = distribution
            .values
            .iter()
            .map(|v| format!("{} ({})", v.value, v.count))
            .collect();
        lines.push(format!("- {}: {}", distribution.column, values.join(", ")));
    }
    lines.join("\n")
}
