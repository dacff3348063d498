use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tokio::sync::oneshot;
use tracing::info;

use crate::{
    agents::{Agent, AnalysisAgent, QueryAgent},
    config::AppConfig,
    executor::QueryExecutor,
    ingest::LoadedCorpus,
    orchestrator::Orchestrator,
    taxonomy::Taxonomy,
    vocabulary::Vocabulary,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub corpus: Arc<LoadedCorpus>,
    pub taxonomy: Arc<Taxonomy>,
    pub orchestrator: Arc<Orchestrator>,
    /// Pasa a `false` en cuanto llega la señal de apagado.
    pub accepting: Arc<AtomicBool>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    /// Construye la taxonomía, los agentes y el orquestador sobre un corpus
    /// ya cargado. Devuelve también el receptor de la señal de apagado.
    pub fn build(
        config: AppConfig,
        corpus: LoadedCorpus,
        vocabulary: Vocabulary,
    ) -> (Self, oneshot::Receiver<()>) {
        let corpus = Arc::new(corpus);
        let vocabulary = Arc::new(vocabulary);
        let taxonomy = Arc::new(Taxonomy::build(&corpus, &vocabulary, &config.taxonomy_settings()));
        let stats = taxonomy.stats();
        info!(
            tables = stats.tables,
            coded_entities = stats.coded_entities,
            performance_entities = stats.performance_entities,
            indexed_terms = stats.indexed_terms,
            "Taxonomía construida"
        );

        let executor = QueryExecutor::new(corpus.clone(), taxonomy.clone(), config.search_result_limit);
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(QueryAgent::new(vocabulary.clone(), taxonomy.clone(), executor.clone())),
            Arc::new(AnalysisAgent::new(taxonomy.clone(), executor)),
        ];
        let orchestrator = Arc::new(Orchestrator::new(vocabulary, agents));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = Self {
            config,
            corpus,
            taxonomy,
            orchestrator,
            accepting: Arc::new(AtomicBool::new(true)),
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
        };
        (state, shutdown_rx)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Deja de aceptar consultas y dispara la señal de apagado (una sola vez).
    pub fn begin_shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let sender = self
            .shutdown_sender
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}
