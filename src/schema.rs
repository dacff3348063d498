//! Inferencia del perfil de tipos de cada columna a partir de una muestra
//! acotada de valores no vacíos.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::models::{CellValue, ColumnProfile, ColumnType, Table, TableSchema};

const MAX_SAMPLES: usize = 10;

const DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%m/%d/%y",
    "%d-%b-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%m/%d/%Y %H:%M"];

/// Interpreta un texto como número admitiendo `$`, separadores de miles y
/// un `%` final.
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let cleaned: String = trimmed
        .trim_end_matches('%')
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    let value = cleaned.trim().parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}

/// Valor numérico de una celda, si lo tiene.
pub fn cell_number(value: &CellValue) -> Option<f64> {
    match value {
        CellValue::Number(n) if n.is_finite() => Some(*n),
        CellValue::Text(s) => parse_number(s),
        _ => None,
    }
}

pub fn looks_like_date(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.len() < 6 {
        return false;
    }
    DATE_FORMATS
        .iter()
        .any(|fmt| NaiveDate::parse_from_str(trimmed, fmt).is_ok())
        || DATETIME_FORMATS
            .iter()
            .any(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).is_ok())
        || DateTime::parse_from_rfc3339(trimmed).is_ok()
}

pub fn is_boolean_token(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "false" | "1" | "0")
}

/// Indicador binario activo: número distinto de cero, booleano verdadero o
/// un token afirmativo.
pub fn is_truthy(value: &CellValue) -> bool {
    match value {
        CellValue::Null => false,
        CellValue::Bool(b) => *b,
        CellValue::Number(n) => *n != 0.0,
        CellValue::Text(s) => {
            let lowered = s.trim().to_ascii_lowercase();
            match lowered.as_str() {
                "true" | "yes" | "y" | "x" => true,
                _ => parse_number(&lowered).is_some_and(|n| n != 0.0),
            }
        }
    }
}

/// Contadores por tipo en orden fijo: el orden de declaración es el
/// desempate (number → date → boolean → string).
#[derive(Debug, Default)]
struct TypeCounts {
    number: usize,
    date: usize,
    boolean: usize,
    string: usize,
}

impl TypeCounts {
    fn record(&mut self, value: &CellValue) {
        match value {
            CellValue::Null => {}
            CellValue::Number(_) => self.number += 1,
            CellValue::Bool(_) => self.boolean += 1,
            CellValue::Text(s) => {
                let mut matched = false;
                if parse_number(s).is_some() {
                    self.number += 1;
                    matched = true;
                }
                if looks_like_date(s) {
                    self.date += 1;
                    matched = true;
                }
                if is_boolean_token(s) {
                    self.boolean += 1;
                    matched = true;
                }
                if !matched {
                    self.string += 1;
                }
            }
        }
    }

    fn winner(&self) -> ColumnType {
        let ordered = [
            (ColumnType::Number, self.number),
            (ColumnType::Date, self.date),
            (ColumnType::Boolean, self.boolean),
            (ColumnType::String, self.string),
        ];
        let mut best = (ColumnType::String, 0usize);
        for (column_type, count) in ordered {
            if count > best.1 {
                best = (column_type, count);
            }
        }
        best.0
    }
}

/// Perfil de la columna `index` de la tabla.
pub fn profile_column(table: &Table, index: usize, sample_size: usize) -> ColumnProfile {
    let mut counts = TypeCounts::default();
    let mut nullable = false;
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique = true;
    let mut samples: Vec<String> = Vec::new();
    let mut sampled = 0usize;

    for value in table.column_values(index) {
        if value.is_empty() {
            nullable = true;
            continue;
        }
        if sampled < sample_size {
            counts.record(value);
            sampled += 1;
        }
        let text = value.to_string();
        if !seen.insert(text.clone()) {
            unique = false;
        } else if samples.len() < MAX_SAMPLES {
            samples.push(text);
        }
    }

    ColumnProfile {
        name: table.columns[index].clone(),
        column_type: counts.winner(),
        nullable,
        unique,
        samples,
    }
}

pub fn infer_schema(table: &Table, sample_size: usize) -> TableSchema {
    TableSchema {
        columns: (0..table.columns.len())
            .map(|idx| profile_column(table, idx, sample_size))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Row;

    fn single_column(values: Vec<CellValue>) -> Table {
        Table::new(
            "t",
            "t.csv",
            vec!["value".into()],
            values.into_iter().map(|v| Row::new(vec![v])).collect(),
        )
    }

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    #[test]
    fn parses_currency_and_percentages() {
        assert_eq!(parse_number("$1,234.50"), Some(1234.5));
        assert_eq!(parse_number("12.5%"), Some(12.5));
        assert_eq!(parse_number("12-AETNA"), None);
        assert_eq!(parse_number("bad"), None);
        assert_eq!(parse_number("NaN"), None);
    }

    #[test]
    fn majority_wins_over_minority_strings() {
        let table = single_column(vec![text("10"), text("20"), text("bad"), text("30")]);
        let profile = profile_column(&table, 0, 100);
        assert_eq!(profile.column_type, ColumnType::Number);
        assert!(!profile.nullable);
        assert!(profile.unique);
    }

    #[test]
    fn numeric_flags_tie_break_towards_number() {
        let table = single_column(vec![text("1"), text("0"), text("1")]);
        let profile = profile_column(&table, 0, 100);
        assert_eq!(profile.column_type, ColumnType::Number);
        assert!(!profile.unique);
        assert_eq!(profile.samples, vec!["1", "0"]);
    }

    #[test]
    fn detects_dates_and_booleans() {
        let dates = single_column(vec![text("2024-01-05"), text("01/12/2024"), text("n/a")]);
        assert_eq!(profile_column(&dates, 0, 100).column_type, ColumnType::Date);

        let flags = single_column(vec![text("true"), text("False"), CellValue::Bool(true)]);
        assert_eq!(profile_column(&flags, 0, 100).column_type, ColumnType::Boolean);
    }

    #[test]
    fn empty_columns_are_nullable_strings() {
        let table = single_column(vec![CellValue::Null, text("  ")]);
        let profile = profile_column(&table, 0, 100);
        assert_eq!(profile.column_type, ColumnType::String);
        assert!(profile.nullable);
        assert!(profile.samples.is_empty());
    }

    #[test]
    fn sample_size_bounds_type_votes() {
        let mut values: Vec<CellValue> = (0..3).map(|i| text(&i.to_string())).collect();
        values.extend((0..10).map(|i| text(&format!("word {i}"))));
        let table = single_column(values);
        assert_eq!(profile_column(&table, 0, 3).column_type, ColumnType::Number);
        assert_eq!(profile_column(&table, 0, 100).column_type, ColumnType::String);
    }

    #[test]
    fn truthiness_of_flag_cells() {
        assert!(is_truthy(&CellValue::Number(1.0)));
        assert!(is_truthy(&text("yes")));
        assert!(is_truthy(&text("1")));
        assert!(!is_truthy(&text("0")));
        assert!(!is_truthy(&text("no")));
        assert!(!is_truthy(&CellValue::Null));
    }
}
