//! Carga y gestión de configuración de la aplicación (datos, vocabulario,
//! servidor).

use std::{env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::taxonomy::TaxonomySettings;

pub const DEFAULT_CODED_ENTITY_PATTERN: &str = r"\b\d{1,2}-[A-Z]+(?: [A-Z]+)*\b";
pub const DEFAULT_PERFORMANCE_COLUMN: &str = "Performance Diagnostic";

static DEFAULT_CODED_ENTITY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_CODED_ENTITY_PATTERN).expect("patrón de entidad por defecto"));

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub data_dir: PathBuf,
    pub static_dir: Option<PathBuf>,
    pub vocabulary_path: Option<PathBuf>,

    pub coded_entity_pattern: Regex,
    pub performance_column: String,
    pub schema_sample_size: usize,
    pub search_result_limit: usize,
    pub shutdown_grace: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:3322".to_string(),
            data_dir: PathBuf::from("data"),
            static_dir: None,
            vocabulary_path: None,
            coded_entity_pattern: DEFAULT_CODED_ENTITY_REGEX.clone(),
            performance_column: DEFAULT_PERFORMANCE_COLUMN.to_string(),
            schema_sample_size: 100,
            search_result_limit: 50,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una fuente de variables arbitraria.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let server_addr = lookup("SERVER_ADDR").unwrap_or(defaults.server_addr);
        let data_dir = lookup("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir);
        let static_dir = lookup("STATIC_DIR").filter(|s| !s.is_empty()).map(PathBuf::from);
        let vocabulary_path = lookup("VOCABULARY_PATH").filter(|s| !s.is_empty()).map(PathBuf::from);

        let coded_entity_pattern = match lookup("CODED_ENTITY_PATTERN").filter(|s| !s.is_empty()) {
            Some(pattern) => Regex::new(&pattern)
                .map_err(|e| anyhow!("CODED_ENTITY_PATTERN inválido ({pattern}): {e}"))?,
            None => defaults.coded_entity_pattern,
        };
        let performance_column = lookup("PERFORMANCE_COLUMN")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.performance_column);

        let schema_sample_size = parse_positive(&lookup, "SCHEMA_SAMPLE_SIZE", defaults.schema_sample_size)?;
        let search_result_limit = parse_positive(&lookup, "SEARCH_RESULT_LIMIT", defaults.search_result_limit)?;
        let shutdown_grace = Duration::from_secs(
            parse_positive(&lookup, "SHUTDOWN_GRACE_SECS", defaults.shutdown_grace.as_secs() as usize)? as u64,
        );

        Ok(Self {
            server_addr,
            data_dir,
            static_dir,
            vocabulary_path,
            coded_entity_pattern,
            performance_column,
            schema_sample_size,
            search_result_limit,
            shutdown_grace,
        })
    }

    pub fn taxonomy_settings(&self) -> TaxonomySettings {
        TaxonomySettings {
            coded_entity_pattern: self.coded_entity_pattern.clone(),
            performance_column: self.performance_column.clone(),
        }
    }
}

fn parse_positive<F>(lookup: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(anyhow!("{key} debe ser un entero positivo, recibido '{raw}'")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_variables() {
        let cfg = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(cfg.server_addr, "127.0.0.1:3322");
        assert_eq!(cfg.data_dir, PathBuf::from("data"));
        assert_eq!(cfg.search_result_limit, 50);
        assert_eq!(cfg.schema_sample_size, 100);
        assert!(cfg.coded_entity_pattern.is_match("12-AETNA"));
    }

    #[test]
    fn reads_overrides() {
        let cfg = AppConfig::from_lookup(lookup_from(&[
            ("DATA_DIR", "/srv/data"),
            ("CODED_ENTITY_PATTERN", r"[A-Z]{3}-\d+"),
            ("SEARCH_RESULT_LIMIT", "10"),
            ("SHUTDOWN_GRACE_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/data"));
        assert!(cfg.coded_entity_pattern.is_match("PAY-42"));
        assert_eq!(cfg.search_result_limit, 10);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(3));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(AppConfig::from_lookup(lookup_from(&[("SEARCH_RESULT_LIMIT", "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("SCHEMA_SAMPLE_SIZE", "abc")])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("CODED_ENTITY_PATTERN", "(")])).is_err());
    }
}
