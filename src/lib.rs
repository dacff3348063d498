// Módulos de la aplicación
pub mod agents;
pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod intent;
pub mod models;
pub mod nlp;
pub mod orchestrator;
pub mod resolver;
pub mod schema;
pub mod synthesizer;
pub mod taxonomy;
pub mod vocabulary;
