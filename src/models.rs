//! Modelos de dominio: fuentes tabulares, filas, perfiles de columna y
//! entidades descubiertas en los datos.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Valor escalar de una celda.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Una celda vacía es `Null` o texto en blanco.
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Convierte un valor JSON arbitrario en celda; los objetos y listas
    /// anidados se guardan como su texto JSON.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => CellValue::Null,
            serde_json::Value::Bool(b) => CellValue::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(CellValue::Number)
                .unwrap_or_else(|| CellValue::Text(n.to_string())),
            serde_json::Value::String(s) if s.trim().is_empty() => CellValue::Null,
            serde_json::Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Null => serde_json::Value::Null,
            CellValue::Bool(b) => serde_json::Value::Bool(*b),
            CellValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            CellValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => Ok(()),
            CellValue::Bool(b) => write!(f, "{b}"),
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            CellValue::Number(n) => write!(f, "{n}"),
            CellValue::Text(s) => f.write_str(s),
        }
    }
}

/// Una fila: valores alineados con `Table::columns`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub values: Vec<CellValue>,
}

impl Row {
    pub fn new(values: Vec<CellValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&CellValue> {
        self.values.get(index)
    }
}

/// Conjunto de filas de una hoja o fichero.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub source: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    /// Construye la tabla normalizando las cabeceras: vacías pasan a
    /// `column_<n>` y las repetidas reciben el sufijo ` (<k>)`.
    pub fn new(name: impl Into<String>, source: impl Into<String>, headers: Vec<String>, rows: Vec<Row>) -> Self {
        let mut columns: Vec<String> = Vec::with_capacity(headers.len());
        for (idx, header) in headers.into_iter().enumerate() {
            let base = if header.trim().is_empty() {
                format!("column_{}", idx + 1)
            } else {
                header.trim().to_string()
            };
            let mut candidate = base.clone();
            let mut k = 2;
            while columns.contains(&candidate) {
                candidate = format!("{base} ({k})");
                k += 1;
            }
            columns.push(candidate);
        }
        Self {
            name: name.into(),
            source: source.into(),
            columns,
            rows,
        }
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// Búsqueda de columna sin distinguir mayúsculas.
    pub fn find_column(&self, column: &str) -> Option<usize> {
        self.column_index(column).or_else(|| {
            let wanted = column.to_lowercase();
            self.columns.iter().position(|c| c.to_lowercase() == wanted)
        })
    }

    /// Iterador sobre los valores de una columna (las filas cortas dan `Null`).
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &CellValue> + '_ {
        self.rows
            .iter()
            .map(move |row| row.get(index).unwrap_or(&CellValue::Null))
    }

    /// Fila como objeto JSON con el nombre de columna como clave.
    pub fn row_to_json(&self, row: &Row) -> serde_json::Map<String, serde_json::Value> {
        self.columns
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let value = row.get(idx).map(CellValue::to_json).unwrap_or(serde_json::Value::Null);
                (col.clone(), value)
            })
            .collect()
    }
}

/// Fichero tabular cargado; inmutable tras la carga.
#[derive(Debug, Clone)]
pub struct DataSource {
    pub name: String,
    pub path: PathBuf,
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Number,
    Date,
    Boolean,
    String,
}

/// Perfil inferido de una columna.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnProfile {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    pub samples: Vec<String>,
}

/// Perfiles de todas las columnas de una tabla, en el orden de la tabla.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnProfile>,
}

impl TableSchema {
    pub fn profile(&self, column: &str) -> Option<&ColumnProfile> {
        self.columns.iter().find(|p| p.name == column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnRole {
    Narrative,
    Metric,
    Identifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// `<código>-<NOMBRE>` encontrado en texto narrativo.
    Coded,
    /// Valor del vocabulario fijo de la columna de rendimiento.
    Performance,
}

/// Entidad de dominio descubierta en los datos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entity {
    pub kind: EntityKind,
    /// Subcadena exacta tal y como aparece en los datos, p. ej. `12-AETNA`.
    pub canonical_form: String,
    /// Parte legible, p. ej. `AETNA`.
    pub name: String,
    pub aliases: Vec<String>,
    pub search_terms: Vec<String>,
}

impl Entity {
    /// Todos los términos normalizados por los que se indexa la entidad.
    pub fn index_terms(&self) -> impl Iterator<Item = &String> {
        self.search_terms.iter().chain(self.aliases.iter())
    }
}
