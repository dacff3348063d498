//! Carga de un directorio de ficheros tabulares (CSV, JSON, Excel) en
//! memoria, con el perfil de tipos de cada columna.
//!
//! Un fichero que no se puede leer se registra y se omite: nunca detiene la
//! carga del resto del corpus.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto, CellType, DataType, Range, Reader};
use csv::{ReaderBuilder, Trim};
use serde_json::Value;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::{
    models::{CellValue, DataSource, Row, Table, TableSchema},
    schema,
};

/// Resumen de los resultados de una carga.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_loaded: u32,
    pub files_skipped: u32,
    pub tables_loaded: usize,
    pub rows_loaded: usize,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} cargados, {} omitidos. {} tablas y {} filas en memoria.",
            self.files_scanned, self.files_loaded, self.files_skipped, self.tables_loaded, self.rows_loaded
        )
    }
}

/// Corpus completo en memoria: fuentes, esquemas por tabla y resumen.
#[derive(Debug, Clone, Default)]
pub struct LoadedCorpus {
    pub sources: Vec<DataSource>,
    pub schemas: BTreeMap<String, TableSchema>,
    pub summary: IngestionSummary,
}

impl LoadedCorpus {
    /// Perfila todas las tablas de las fuentes ya leídas.
    pub fn from_sources(sources: Vec<DataSource>, sample_size: usize) -> Self {
        let mut schemas = BTreeMap::new();
        let mut summary = IngestionSummary::default();
        for table in sources.iter().flat_map(|s| s.tables.iter()) {
            summary.tables_loaded += 1;
            summary.rows_loaded += table.rows.len();
            schemas.insert(table.name.clone(), schema::infer_schema(table, sample_size));
        }
        Self {
            sources,
            schemas,
            summary,
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.sources.iter().flat_map(|s| s.tables.iter())
    }

    pub fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.schemas.get(table)
    }

    pub fn is_empty(&self) -> bool {
        self.tables().next().is_none()
    }
}

/// Recorre recursivamente `root` (en orden de nombre, para que la carga sea
/// determinista) y carga cada fichero soportado.
pub fn load_directory(root: &Path, sample_size: usize) -> Result<LoadedCorpus> {
    if !root.is_dir() {
        return Err(anyhow!("La ruta de datos no es un directorio: {}", root.display()));
    }

    let mut files_scanned = 0u32;
    let mut files_loaded = 0u32;
    let mut files_skipped = 0u32;
    let mut sources = Vec::new();
    let mut table_names: HashSet<String> = HashSet::new();

    let file_entries: Vec<_> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .collect();

    for entry in &file_entries {
        files_scanned += 1;
        let path = entry.path();
        match load_file(path) {
            Ok(Some(mut source)) => {
                for table in &mut source.tables {
                    table.name = unique_table_name(&table.name, &mut table_names);
                }
                info!(
                    "Cargado {} ({} tablas, {} filas).",
                    path.display(),
                    source.tables.len(),
                    source.tables.iter().map(|t| t.rows.len()).sum::<usize>()
                );
                files_loaded += 1;
                sources.push(source);
            }
            Ok(None) => files_skipped += 1,
            Err(err) => {
                files_skipped += 1;
                error!("Error cargando {}: {err:#}", path.display());
            }
        }
    }

    let mut corpus = LoadedCorpus::from_sources(sources, sample_size);
    corpus.summary.files_scanned = files_scanned;
    corpus.summary.files_loaded = files_loaded;
    corpus.summary.files_skipped = files_skipped;
    Ok(corpus)
}

fn unique_table_name(name: &str, taken: &mut HashSet<String>) -> String {
    let mut candidate = name.to_string();
    let mut k = 2;
    while taken.contains(&candidate) {
        candidate = format!("{name} ({k})");
        k += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

/// Carga un fichero; `Ok(None)` si la extensión no está soportada.
pub fn load_file(path: &Path) -> Result<Option<DataSource>> {
    let extension = path.extension().and_then(std::ffi::OsStr::to_str).unwrap_or("");
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.clone());

    let tables = match extension.to_lowercase().as_str() {
        "csv" => vec![read_csv(path, &stem, &file_name)?],
        "json" => read_json(path, &stem, &file_name)?,
        "xlsx" | "xlsm" | "xls" | "ods" => read_workbook(path, &stem, &file_name)?,
        _ => {
            info!("Saltando fichero con extensión no soportada ('.{}'): {}", extension, path.display());
            return Ok(None);
        }
    };

    if tables.is_empty() {
        warn!("Fichero sin tablas utilizables: {}", path.display());
        return Ok(None);
    }

    Ok(Some(DataSource {
        name: file_name,
        path: path.to_path_buf(),
        tables,
    }))
}

fn read_csv(path: &Path, stem: &str, file_name: &str) -> Result<Table> {
    let bytes = fs::read(path).with_context(|| format!("No se pudo leer {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);
    parse_csv(&content, stem, file_name)
}

pub fn parse_csv(content: &str, table_name: &str, source: &str) -> Result<Table> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(content.trim_start_matches('\u{feff}').as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("No se pudieron leer las cabeceras CSV")?
        .iter()
        .map(str::to_string)
        .collect();
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(anyhow!("CSV sin cabeceras"));
    }

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Fila CSV {} inválida", index + 1))?;
        let mut values: Vec<CellValue> = record
            .iter()
            .map(|field| {
                if field.is_empty() {
                    CellValue::Null
                } else {
                    CellValue::Text(field.to_string())
                }
            })
            .collect();
        values.resize(headers.len(), CellValue::Null);
        rows.push(Row::new(values));
    }

    Ok(Table::new(table_name, source, headers, rows))
}

fn read_json(path: &Path, stem: &str, file_name: &str) -> Result<Vec<Table>> {
    let raw = fs::read_to_string(path).with_context(|| format!("No se pudo leer {}", path.display()))?;
    parse_json(&raw, stem, file_name)
}

/// Acepta un array de objetos (una tabla) o un objeto cuyos valores son
/// arrays de objetos (una tabla por clave, como las hojas convertidas).
pub fn parse_json(raw: &str, stem: &str, source: &str) -> Result<Vec<Table>> {
    let value: Value = serde_json::from_str(raw).context("JSON inválido")?;
    match value {
        Value::Array(items) => Ok(vec![json_table(stem.to_string(), source, &items)?]),
        Value::Object(map) => {
            let mut tables = Vec::new();
            for (key, value) in &map {
                if let Value::Array(items) = value {
                    if items.iter().all(Value::is_object) {
                        tables.push(json_table(format!("{stem}/{key}"), source, items)?);
                    }
                }
            }
            if tables.is_empty() {
                return Err(anyhow!("El objeto JSON no contiene arrays de registros"));
            }
            Ok(tables)
        }
        _ => Err(anyhow!("Formato JSON no tabular")),
    }
}

fn json_table(name: String, source: &str, items: &[Value]) -> Result<Table> {
    let mut headers: Vec<String> = Vec::new();
    for item in items {
        let object = item
            .as_object()
            .ok_or_else(|| anyhow!("La tabla '{name}' contiene elementos que no son objetos"))?;
        for key in object.keys() {
            if !headers.contains(key) {
                headers.push(key.clone());
            }
        }
    }

    let rows = items
        .iter()
        .filter_map(Value::as_object)
        .map(|object| {
            Row::new(
                headers
                    .iter()
                    .map(|h| object.get(h).map(CellValue::from_json).unwrap_or(CellValue::Null))
                    .collect(),
            )
        })
        .collect();

    Ok(Table::new(name, source, headers, rows))
}

fn read_workbook(path: &Path, stem: &str, file_name: &str) -> Result<Vec<Table>> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| anyhow!("No se pudo abrir el libro {}: {}", path.display(), e))?;
    let sheet_names = workbook.sheet_names().to_vec();

    let mut tables = Vec::new();
    for (idx, sheet) in sheet_names.iter().enumerate() {
        let range = match workbook.worksheet_range_at(idx) {
            Some(Ok(range)) => range,
            Some(Err(e)) => {
                warn!("Hoja '{}' de {} ilegible: {}", sheet, path.display(), e);
                continue;
            }
            None => continue,
        };

        if let Some(table) = sheet_table(&range, format!("{stem}/{sheet}"), file_name) {
            tables.push(table);
        }
    }
    Ok(tables)
}

/// Primera fila como cabecera; las filas sin ningún valor se descartan.
/// Una hoja vacía no produce tabla.
fn sheet_table<T>(range: &Range<T>, name: String, file_name: &str) -> Option<Table>
where
    T: CellType + DataType + std::fmt::Display,
{
    let mut rows_iter = range.rows();
    let header_row = rows_iter.next()?;
    let headers: Vec<String> = header_row.iter().map(|c| c.to_string()).collect();

    let rows: Vec<Row> = rows_iter
        .map(|cells| {
            let mut values: Vec<CellValue> = cells.iter().map(workbook_cell).collect();
            values.resize(headers.len(), CellValue::Null);
            Row::new(values)
        })
        .filter(|row| row.values.iter().any(|v| !v.is_empty()))
        .collect();

    Some(Table::new(name, file_name, headers, rows))
}

fn workbook_cell<T: DataType + std::fmt::Display>(cell: &T) -> CellValue {
    if cell.is_empty() {
        CellValue::Null
    } else if let Some(b) = cell.get_bool() {
        CellValue::Bool(b)
    } else if let Some(i) = cell.get_int() {
        CellValue::Number(i as f64)
    } else if let Some(f) = cell.get_float() {
        CellValue::Number(f)
    } else if let Some(s) = cell.get_string() {
        if s.trim().is_empty() {
            CellValue::Null
        } else {
            CellValue::Text(s.to_string())
        }
    } else {
        CellValue::Text(cell.to_string())
    }
}
