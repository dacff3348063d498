//! Agentes que ejecutan los pasos del plan. Cada agente declara las
//! acciones que soporta y recibe el contexto compartido de la petición,
//! donde quedan guardados los resultados de los pasos anteriores.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::AgentError,
    executor::{QueryExecutor, QueryOutcome},
    intent::IntentAnalysis,
    models::{ColumnRole, EntityKind},
    nlp::QueryProcessor,
    resolver::{EntityResolver, ResolvedQuery},
    taxonomy::Taxonomy,
    vocabulary::Vocabulary,
};

const TOP_VALUES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentErrorBody {
    pub message: String,
    pub code: String,
}

/// Resultado serializable de un paso (o de la petición completa).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResult {
    pub success: bool,
    pub agent: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentErrorBody>,
    pub confidence: f64,
    pub processing_time_ms: u64,
}

impl AgentResult {
    pub fn ok(agent: &str, action: &str, data: serde_json::Value, confidence: f64, started: Instant) -> Self {
        Self {
            success: true,
            agent: agent.to_string(),
            action: action.to_string(),
            data: Some(data),
            error: None,
            confidence,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn failed(agent: &str, action: &str, error: &AgentError, started: Instant) -> Self {
        Self {
            success: false,
            agent: agent.to_string(),
            action: action.to_string(),
            data: None,
            error: Some(AgentErrorBody {
                message: error.to_string(),
                code: error.code().to_string(),
            }),
            confidence: 0.0,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStep {
    pub resolved: ResolvedQuery,
    pub outcome: QueryOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityComparison {
    pub entity: String,
    pub kind: EntityKind,
    pub total_matches: usize,
    /// tabla → filas coincidentes
    pub tables: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueCount {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDistribution {
    pub table: String,
    pub column: String,
    pub values: Vec<ValueCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "analysis", rename_all = "lowercase")]
pub enum AnalysisOutcome {
    Compare { entities: Vec<EntityComparison> },
    Analyze {
        rows_analyzed: usize,
        distributions: Vec<ColumnDistribution>,
    },
}

/// Datos tipados que produce un paso.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepData {
    Query(Box<QueryStep>),
    Analysis(AnalysisOutcome),
}

/// Último resultado de cada tipo de agente dentro de una petición.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepOutputs {
    pub query: Option<QueryStep>,
    pub analysis: Option<AnalysisOutcome>,
}

impl StepOutputs {
    pub fn store(&mut self, data: StepData) {
        match data {
            StepData::Query(step) => self.query = Some(*step),
            StepData::Analysis(outcome) => self.analysis = Some(outcome),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub data: StepData,
    pub confidence: f64,
}

/// Contexto compartido por los pasos de una misma petición.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: Uuid,
    pub query: String,
    pub normalized_query: String,
    pub intent_analysis: IntentAnalysis,
    pub request_context: Option<serde_json::Value>,
    pub outputs: StepOutputs,
}

impl ExecutionContext {
    pub fn new(
        query: &str,
        normalized_query: String,
        intent_analysis: IntentAnalysis,
        request_context: Option<serde_json::Value>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            query: query.to_string(),
            normalized_query,
            intent_analysis,
            request_context,
            outputs: StepOutputs::default(),
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    fn actions(&self) -> &'static [&'static str];

    fn supports(&self, action: &str) -> bool {
        self.actions().iter().any(|a| *a == action)
    }

    async fn execute(&self, action: &str, ctx: &ExecutionContext) -> Result<AgentOutput, AgentError>;
}

fn unsupported(agent: &dyn Agent, action: &str) -> AgentError {
    AgentError::UnsupportedAction {
        agent: agent.name().to_string(),
        action: action.to_string(),
    }
}

// --- QueryAgent ---

/// NLP → resolución → ejecución.
pub struct QueryAgent {
    vocabulary: Arc<Vocabulary>,
    taxonomy: Arc<Taxonomy>,
    executor: QueryExecutor,
}

impl QueryAgent {
    pub const NAME: &'static str = "query";

    pub fn new(vocabulary: Arc<Vocabulary>, taxonomy: Arc<Taxonomy>, executor: QueryExecutor) -> Self {
        Self {
            vocabulary,
            taxonomy,
            executor,
        }
    }
}

#[async_trait]
impl Agent for QueryAgent {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn actions(&self) -> &'static [&'static str] {
        &crate::executor::Operation::ALL
    }

    async fn execute(&self, action: &str, ctx: &ExecutionContext) -> Result<AgentOutput, AgentError> {
        if !self.supports(action) {
            return Err(unsupported(self, action));
        }
        let nlp = QueryProcessor::new(&self.vocabulary).process_with_intent(
            &ctx.query,
            ctx.normalized_query.clone(),
            ctx.intent_analysis.clone(),
        );
        let resolved = EntityResolver::new(&self.taxonomy, &self.vocabulary).resolve(&ctx.query, &nlp);
        let outcome = self.executor.execute(action, &resolved)?;
        debug!(
            request_id = %ctx.request_id,
            action,
            used_fallback = resolved.used_fallback,
            "Paso de consulta ejecutado"
        );

        let confidence = resolved.confidence;
        Ok(AgentOutput {
            data: StepData::Query(Box::new(QueryStep { resolved, outcome })),
            confidence,
        })
    }
}

// --- AnalysisAgent ---

/// Comparación entre entidades y distribuciones sobre las filas del paso
/// de consulta anterior.
pub struct AnalysisAgent {
    taxonomy: Arc<Taxonomy>,
    executor: QueryExecutor,
}

impl AnalysisAgent {
    pub const NAME: &'static str = "analysis";
    const ACTIONS: [&'static str; 2] = ["compare", "analyze"];

    pub fn new(taxonomy: Arc<Taxonomy>, executor: QueryExecutor) -> Self {
        Self { taxonomy, executor }
    }

    fn compare(&self, prior: &QueryStep) -> AgentOutput {
        let resolved = &prior.resolved;
        let entities: Vec<EntityComparison> = resolved
            .resolved_entities
            .iter()
            .map(|entity| {
                let terms: Vec<String> = std::iter::once(entity.resolved_value.clone())
                    .chain(entity.entity.search_terms.iter().cloned())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let search = self.executor.search_terms(&terms, &resolved.target_columns);
                EntityComparison {
                    entity: entity.resolved_value.clone(),
                    kind: entity.kind,
                    total_matches: search.total_matches,
                    tables: search
                        .tables
                        .iter()
                        .map(|t| (t.table.clone(), t.total_matches))
                        .collect(),
                }
            })
            .collect();

        // Con menos de dos entidades no hay comparación real.
        let confidence = if entities.len() >= 2 {
            resolved.confidence
        } else {
            resolved.confidence / 2.0
        };
        AgentOutput {
            data: StepData::Analysis(AnalysisOutcome::Compare { entities }),
            confidence,
        }
    }

    fn analyze(&self, prior: &QueryStep) -> AgentOutput {
        let resolved = &prior.resolved;
        let mut rows_analyzed = 0;
        let mut distributions = Vec::new();

        for table in self.executor.corpus().tables() {
            let matches = self
                .executor
                .matching_rows(table, &resolved.search_terms, &resolved.target_columns);
            if matches.is_empty() {
                continue;
            }
            rows_analyzed += matches.len();

            for (idx, column) in table.columns.iter().enumerate() {
                if self.taxonomy.role_of(&table.name, column) != Some(ColumnRole::Identifier) {
                    continue;
                }
                let mut counts: HashMap<String, usize> = HashMap::new();
                for (row_index, _) in &matches {
                    if let Some(value) = table.rows[*row_index].get(idx).filter(|v| !v.is_empty()) {
                        *counts.entry(value.to_string()).or_insert(0) += 1;
                    }
                }
                if counts.is_empty() {
                    continue;
                }
                let mut values: Vec<ValueCount> = counts
                    .into_iter()
                    .map(|(value, count)| ValueCount { value, count })
                    .collect();
                values.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
                values.truncate(TOP_VALUES);
                distributions.push(ColumnDistribution {
                    table: table.name.clone(),
                    column: column.clone(),
                    values,
                });
            }
        }

        let confidence = if distributions.is_empty() {
            0.3
        } else {
            resolved.confidence
        };
        AgentOutput {
            data: StepData::Analysis(AnalysisOutcome::Analyze {
                rows_analyzed,
                distributions,
            }),
            confidence,
        }
    }
}

#[async_trait]
impl Agent for AnalysisAgent {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn actions(&self) -> &'static [&'static str] {
        &Self::ACTIONS
    }

    async fn execute(&self, action: &str, ctx: &ExecutionContext) -> Result<AgentOutput, AgentError> {
        if !self.supports(action) {
            return Err(unsupported(self, action));
        }
        let prior = ctx
            .outputs
            .query
            .as_ref()
            .ok_or_else(|| AgentError::MissingParameter("resultado del paso de consulta".to_string()))?;

        Ok(match action {
            "compare" => self.compare(prior),
            _ => self.analyze(prior),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::IntentClassifier;
    use crate::nlp::normalize;
    use crate::taxonomy::tests::revenue_corpus;

    struct Fixture {
        vocabulary: Arc<Vocabulary>,
        query: QueryAgent,
        analysis: AnalysisAgent,
    }

    fn fixture() -> Fixture {
        let vocabulary = Arc::new(Vocabulary::embedded().unwrap());
        let corpus = Arc::new(revenue_corpus());
        let taxonomy = Arc::new(Taxonomy::build(
            &corpus,
            &vocabulary,
            &crate::taxonomy::tests::settings(),
        ));
        let executor = QueryExecutor::new(corpus, taxonomy.clone(), 50);
        Fixture {
            query: QueryAgent::new(vocabulary.clone(), taxonomy.clone(), executor.clone()),
            analysis: AnalysisAgent::new(taxonomy, executor),
            vocabulary,
        }
    }

    fn context(vocabulary: &Vocabulary, query: &str) -> ExecutionContext {
        let normalized = normalize(query);
        let analysis = IntentClassifier::new(vocabulary).classify(&normalized);
        ExecutionContext::new(query, normalized, analysis, None)
    }

    #[test]
    fn query_agent_embeds_resolution_and_outcome() {
        let fx = fixture();
        let ctx = context(&fx.vocabulary, "show me aetna");
        let output = tokio_test::block_on(fx.query.execute("search", &ctx)).unwrap();
        let StepData::Query(step) = output.data else {
            panic!("se esperaba un paso de consulta");
        };
        assert_eq!(step.resolved.resolved_entities[0].resolved_value, "12-AETNA");
        assert!((output.confidence - step.resolved.confidence).abs() < 1e-9);
        let QueryOutcome::Search(search) = &step.outcome else {
            panic!("se esperaba una búsqueda");
        };
        assert_eq!(search.total_matches, 3);
    }

    #[tokio::test]
    async fn unsupported_action_is_rejected() {
        let fx = fixture();
        let ctx = context(&fx.vocabulary, "show me aetna");
        let err = fx.query.execute("compare", &ctx).await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_ACTION");
        let err = fx.analysis.execute("search", &ctx).await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_ACTION");
    }

    #[tokio::test]
    async fn analysis_requires_prior_query_step() {
        let fx = fixture();
        let ctx = context(&fx.vocabulary, "compare aetna vs bcbs");
        let err = fx.analysis.execute("compare", &ctx).await.unwrap_err();
        assert_eq!(err.code(), "MISSING_PARAMETER");
    }

    #[tokio::test]
    async fn compare_counts_rows_per_entity() {
        let fx = fixture();
        let mut ctx = context(&fx.vocabulary, "compare aetna vs bcbs");
        let step = fx.query.execute("search", &ctx).await.unwrap();
        ctx.outputs.store(step.data);

        let output = fx.analysis.execute("compare", &ctx).await.unwrap();
        let StepData::Analysis(AnalysisOutcome::Compare { entities }) = output.data else {
            panic!("se esperaba una comparación");
        };
        let totals: Vec<(&str, usize)> = entities
            .iter()
            .map(|e| (e.entity.as_str(), e.total_matches))
            .collect();
        assert!(totals.contains(&("12-AETNA", 3)));
        assert!(totals.contains(&("05-BLUE CROSS", 2)));
    }

    #[tokio::test]
    async fn analyze_reports_identifier_distributions() {
        let fx = fixture();
        let mut ctx = context(&fx.vocabulary, "analyze aetna");
        let step = fx.query.execute("search", &ctx).await.unwrap();
        ctx.outputs.store(step.data);

        let output = fx.analysis.execute("analyze", &ctx).await.unwrap();
        let StepData::Analysis(AnalysisOutcome::Analyze {
            rows_analyzed,
            distributions,
        }) = output.data
        else {
            panic!("se esperaba un análisis");
        };
        assert_eq!(rows_analyzed, 3);
        let payer = distributions.iter().find(|d| d.column == "Payer").unwrap();
        assert_eq!(payer.values[0], ValueCount { value: "Aetna".into(), count: 2 });
        assert_eq!(payer.values[1], ValueCount { value: "BCBS".into(), count: 1 });
    }
}
