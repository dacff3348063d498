//! Orquestador de peticiones.
//!
//! Flujo por petición:
//!   1. Clasificar la intención (una sola vez, compartida con el NLP).
//!   2. Construir y validar el plan de pasos.
//!   3. Ejecutar los pasos en orden, cada uno con el tiempo que le queda al plan.
//!   4. Combinar confianzas y sintetizar la respuesta.
//!
//! El conjunto de agentes se fija en la construcción y no cambia después.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    agents::{Agent, AgentResult, ExecutionContext, StepOutputs},
    error::{AgentError, OrchestratorError},
    intent::{Intent, IntentClassifier},
    nlp::normalize,
    synthesizer::synthesize,
    vocabulary::Vocabulary,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub agent: String,
    pub action: String,
    /// Índices de pasos anteriores de los que depende.
    pub depends_on: Vec<usize>,
}

impl PlanStep {
    fn new(agent: &str, action: &str, depends_on: Vec<usize>) -> Self {
        Self {
            agent: agent.to_string(),
            action: action.to_string(),
            depends_on,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub intent: Intent,
    pub steps: Vec<PlanStep>,
    pub parallel: bool,
    pub timeout_ms: u64,
}

/// Plan fijo por intención.
pub fn build_plan(intent: Intent) -> ExecutionPlan {
    let (steps, timeout_ms) = match intent {
        Intent::Search => (vec![PlanStep::new("query", "search", vec![])], 5_000),
        Intent::Count => (vec![PlanStep::new("query", "count", vec![])], 5_000),
        Intent::Aggregate => (vec![PlanStep::new("query", "aggregate", vec![])], 10_000),
        Intent::Compare => (
            vec![
                PlanStep::new("query", "search", vec![]),
                PlanStep::new("analysis", "compare", vec![0]),
            ],
            15_000,
        ),
        Intent::Analyze => (
            vec![
                PlanStep::new("query", "search", vec![]),
                PlanStep::new("analysis", "analyze", vec![0]),
            ],
            15_000,
        ),
    };
    ExecutionPlan {
        intent,
        steps,
        parallel: false,
        timeout_ms,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "step")]
pub enum RequestState {
    Received,
    IntentClassified,
    PlanBuilt,
    Executing(usize),
    Synthesized,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
struct InFlight {
    state: RequestState,
    started: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrchestratorMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
}

impl OrchestratorMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    fn record(&mut self, success: bool, elapsed: Duration) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.average_response_time_ms +=
            (elapsed_ms - self.average_response_time_ms) / self.total_requests as f64;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub agents: Vec<AgentInfo>,
    pub in_flight: usize,
    pub metrics: OrchestratorMetrics,
    pub success_rate: f64,
}

/// Resultado completo de una petición resuelta.
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub request_id: Uuid,
    pub intent: Intent,
    pub plan: ExecutionPlan,
    pub result: AgentResult,
    pub steps: Vec<AgentResult>,
    pub answer: String,
    pub confidence: f64,
    #[serde(skip)]
    pub outputs: StepOutputs,
}

pub struct Orchestrator {
    agents: BTreeMap<String, Arc<dyn Agent>>,
    vocabulary: Arc<Vocabulary>,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    metrics: Mutex<OrchestratorMetrics>,
}

/// Retira la petición del mapa en curso y registra métricas al salir de
/// `handle`, también si el futuro se cancela.
struct InFlightGuard<'a> {
    orchestrator: &'a Orchestrator,
    request_id: Uuid,
    started: Instant,
    success: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let final_state = if self.success {
            RequestState::Done
        } else {
            RequestState::Failed
        };
        self.orchestrator.set_state(self.request_id, final_state);
        self.orchestrator.lock_in_flight().remove(&self.request_id);
        self.orchestrator
            .lock_metrics()
            .record(self.success, self.started.elapsed());
    }
}

impl Orchestrator {
    pub fn new(vocabulary: Arc<Vocabulary>, agents: Vec<Arc<dyn Agent>>) -> Self {
        let agents = agents
            .into_iter()
            .map(|agent| (agent.name().to_string(), agent))
            .collect();
        Self {
            agents,
            vocabulary,
            in_flight: Mutex::new(HashMap::new()),
            metrics: Mutex::new(OrchestratorMetrics::default()),
        }
    }

    /// Agente conocido, acción soportada y dependencias hacia atrás.
    pub fn validate_plan(&self, plan: &ExecutionPlan) -> Result<(), OrchestratorError> {
        if plan.steps.is_empty() {
            return Err(OrchestratorError::MalformedPlan("el plan no tiene pasos".to_string()));
        }
        for (index, step) in plan.steps.iter().enumerate() {
            let agent = self.agents.get(&step.agent).ok_or_else(|| {
                OrchestratorError::MalformedPlan(format!("agente desconocido '{}' en el paso {index}", step.agent))
            })?;
            if !agent.supports(&step.action) {
                return Err(OrchestratorError::MalformedPlan(format!(
                    "el agente '{}' no soporta '{}' (paso {index})",
                    step.agent, step.action
                )));
            }
            if let Some(dep) = step.depends_on.iter().find(|dep| **dep >= index) {
                return Err(OrchestratorError::MalformedPlan(format!(
                    "el paso {index} depende del paso {dep}, que no es anterior"
                )));
            }
        }
        Ok(())
    }

    pub async fn handle(
        &self,
        query: &str,
        request_context: Option<serde_json::Value>,
    ) -> Result<ChatOutcome, OrchestratorError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(OrchestratorError::EmptyQuery);
        }

        let normalized = normalize(query);
        let analysis = IntentClassifier::new(&self.vocabulary).classify(&normalized);
        let mut ctx = ExecutionContext::new(query, normalized, analysis, request_context);
        let request_id = ctx.request_id;

        let started = Instant::now();
        self.lock_in_flight().insert(
            request_id,
            InFlight {
                state: RequestState::Received,
                started,
            },
        );
        let mut guard = InFlightGuard {
            orchestrator: self,
            request_id,
            started,
            success: false,
        };

        let intent = ctx.intent_analysis.intent;
        self.set_state(request_id, RequestState::IntentClassified);

        let plan = build_plan(intent);
        self.validate_plan(&plan)?;
        self.set_state(request_id, RequestState::PlanBuilt);
        info!(
            request_id = %request_id,
            intent = intent.as_str(),
            steps = plan.steps.len(),
            "Plan de ejecución construido"
        );

        let steps = self.run_steps(&plan, &mut ctx).await?;

        let confidence = if steps.is_empty() {
            0.5
        } else {
            steps.iter().map(|s| s.confidence).sum::<f64>() / steps.len() as f64
        };
        let answer = synthesize(&ctx.outputs, query);
        self.set_state(request_id, RequestState::Synthesized);

        let result = AgentResult {
            success: true,
            agent: "orchestrator".to_string(),
            action: intent.as_str().to_string(),
            data: Some(json!({
                "plan": &plan,
                "steps": &steps,
            })),
            error: None,
            confidence,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };

        guard.success = true;
        info!(
            request_id = %request_id,
            intent = intent.as_str(),
            elapsed_ms = result.processing_time_ms,
            confidence,
            "Petición completada"
        );

        Ok(ChatOutcome {
            request_id,
            intent,
            plan,
            result,
            steps,
            answer,
            confidence,
            outputs: ctx.outputs,
        })
    }

    async fn run_steps(
        &self,
        plan: &ExecutionPlan,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AgentResult>, OrchestratorError> {
        let deadline = Instant::now() + Duration::from_millis(plan.timeout_ms);
        let mut results = Vec::with_capacity(plan.steps.len());

        for (index, step) in plan.steps.iter().enumerate() {
            self.set_state(ctx.request_id, RequestState::Executing(index));
            let agent = self.agents.get(&step.agent).ok_or_else(|| {
                OrchestratorError::MalformedPlan(format!("agente desconocido '{}'", step.agent))
            })?;

            let step_started = Instant::now();
            let remaining = deadline.saturating_duration_since(step_started);
            let outcome = match tokio::time::timeout(remaining, agent.execute(&step.action, ctx)).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout {
                    agent: step.agent.clone(),
                    action: step.action.clone(),
                    timeout_ms: plan.timeout_ms,
                }),
            }
            .and_then(|output| {
                serde_json::to_value(&output.data)
                    .map(|data| (output, data))
                    .map_err(|e| AgentError::Execution(format!("no se pudo serializar el resultado: {e}")))
            });

            match outcome {
                Ok((output, data)) => {
                    debug!(
                        request_id = %ctx.request_id,
                        step = index,
                        agent = %step.agent,
                        action = %step.action,
                        "Paso completado"
                    );
                    results.push(AgentResult::ok(
                        &step.agent,
                        &step.action,
                        data,
                        output.confidence,
                        step_started,
                    ));
                    ctx.outputs.store(output.data);
                }
                Err(source) => {
                    let failed = AgentResult::failed(&step.agent, &step.action, &source, step_started);
                    error!(
                        request_id = %ctx.request_id,
                        step = index,
                        code = source.code(),
                        "Falló el paso {}:{}: {}",
                        step.agent,
                        step.action,
                        source
                    );
                    return Err(OrchestratorError::StepFailed {
                        step: index,
                        result: Box::new(failed),
                        source,
                    });
                }
            }
        }
        Ok(results)
    }

    pub fn status(&self) -> OrchestratorStatus {
        let metrics = self.lock_metrics().clone();
        OrchestratorStatus {
            agents: self
                .agents
                .values()
                .map(|a| AgentInfo {
                    name: a.name().to_string(),
                    actions: a.actions().iter().map(|s| s.to_string()).collect(),
                })
                .collect(),
            in_flight: self.lock_in_flight().len(),
            success_rate: metrics.success_rate(),
            metrics,
        }
    }

    /// Estado de una petición en curso, si sigue registrada.
    pub fn request_state(&self, request_id: &Uuid) -> Option<RequestState> {
        self.lock_in_flight().get(request_id).map(|f| f.state)
    }

    fn set_state(&self, request_id: Uuid, state: RequestState) {
        if let Some(entry) = self.lock_in_flight().get_mut(&request_id) {
            debug!(
                request_id = %request_id,
                state = ?state,
                elapsed_ms = entry.started.elapsed().as_millis() as u64,
                "Transición de estado"
            );
            entry.state = state;
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, InFlight>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Mapa de peticiones en curso envenenado; se recupera");
                poisoned.into_inner()
            }
        }
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, OrchestratorMetrics> {
        match self.metrics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Métricas del orquestador envenenadas; se recuperan");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentOutput, AnalysisAgent, QueryAgent};
    use crate::executor::QueryExecutor;
    use crate::taxonomy::{tests::revenue_corpus, tests::settings, Taxonomy};
    use async_trait::async_trait;

    fn orchestrator() -> Orchestrator {
        let vocabulary = Arc::new(Vocabulary::embedded().unwrap());
        let corpus = Arc::new(revenue_corpus());
        let taxonomy = Arc::new(Taxonomy::build(&corpus, &vocabulary, &settings()));
        let executor = QueryExecutor::new(corpus, taxonomy.clone(), 50);
        Orchestrator::new(
            vocabulary.clone(),
            vec![
                Arc::new(QueryAgent::new(vocabulary, taxonomy.clone(), executor.clone())),
                Arc::new(AnalysisAgent::new(taxonomy, executor)),
            ],
        )
    }

    /// Agente de consulta que falla o se queda colgado.
    struct BrokenAgent {
        hang: bool,
    }

    #[async_trait]
    impl Agent for BrokenAgent {
        fn name(&self) -> &'static str {
            "query"
        }

        fn actions(&self) -> &'static [&'static str] {
            &["search", "count", "aggregate"]
        }

        async fn execute(&self, _action: &str, _ctx: &ExecutionContext) -> Result<AgentOutput, AgentError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Err(AgentError::Execution("fallo simulado".to_string()))
        }
    }

    fn broken(hang: bool) -> Orchestrator {
        let vocabulary = Arc::new(Vocabulary::embedded().unwrap());
        Orchestrator::new(vocabulary, vec![Arc::new(BrokenAgent { hang })])
    }

    #[test]
    fn plans_follow_intent() {
        let compare = build_plan(Intent::Compare);
        assert_eq!(compare.steps.len(), 2);
        assert_eq!(compare.steps[1].agent, "analysis");
        assert_eq!(compare.steps[1].depends_on, vec![0]);
        assert_eq!(compare.timeout_ms, 15_000);
        assert!(!compare.parallel);

        assert_eq!(build_plan(Intent::Count).steps[0].action, "count");
        assert_eq!(build_plan(Intent::Aggregate).timeout_ms, 10_000);
        assert_eq!(build_plan(Intent::Search).timeout_ms, 5_000);
    }

    #[test]
    fn every_built_plan_validates() {
        let orch = orchestrator();
        for intent in [Intent::Search, Intent::Count, Intent::Compare, Intent::Analyze, Intent::Aggregate] {
            orch.validate_plan(&build_plan(intent)).unwrap();
        }
    }

    #[test]
    fn malformed_plans_are_rejected() {
        let orch = orchestrator();
        let mut plan = build_plan(Intent::Compare);
        plan.steps[1].depends_on = vec![1];
        assert_eq!(orch.validate_plan(&plan).unwrap_err().code(), "MALFORMED_PLAN");

        let mut plan = build_plan(Intent::Search);
        plan.steps[0].agent = "ghost".into();
        assert!(orch.validate_plan(&plan).is_err());

        let mut plan = build_plan(Intent::Search);
        plan.steps[0].action = "delete".into();
        assert!(orch.validate_plan(&plan).is_err());
    }

    #[tokio::test]
    async fn handles_search_end_to_end() {
        let orch = orchestrator();
        let outcome = orch.handle("show me aetna", None).await.unwrap();
        assert_eq!(outcome.intent, Intent::Search);
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.result.agent, "orchestrator");
        assert!(outcome.result.success);
        assert!((outcome.confidence - outcome.steps[0].confidence).abs() < 1e-9);
        assert!(outcome.answer.contains("12-AETNA"));

        let status = orch.status();
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.metrics.total_requests, 1);
        assert_eq!(status.metrics.successful_requests, 1);
        assert!((status.success_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn compare_runs_two_steps_and_averages_confidence() {
        let orch = orchestrator();
        let outcome = orch.handle("compare aetna vs bcbs", None).await.unwrap();
        assert_eq!(outcome.intent, Intent::Compare);
        assert_eq!(outcome.steps.len(), 2);
        let mean = (outcome.steps[0].confidence + outcome.steps[1].confidence) / 2.0;
        assert!((outcome.confidence - mean).abs() < 1e-9);
        assert!(outcome.outputs.analysis.is_some());
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let orch = orchestrator();
        let err = orch.handle("   ", None).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert_eq!(orch.status().metrics.total_requests, 0);
    }

    #[tokio::test]
    async fn failing_step_aborts_and_records_failure() {
        let orch = broken(false);
        let err = orch.handle("show me aetna", None).await.unwrap_err();
        match &err {
            OrchestratorError::StepFailed { step, result, .. } => {
                assert_eq!(*step, 0);
                assert!(!result.success);
                assert_eq!(result.error.as_ref().unwrap().code, "EXECUTION_FAILED");
            }
            other => panic!("error inesperado: {other:?}"),
        }
        let status = orch.status();
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.metrics.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_step_times_out() {
        let orch = broken(true);
        let err = orch.handle("show me aetna", None).await.unwrap_err();
        assert_eq!(err.code(), "STEP_TIMEOUT");
        assert_eq!(orch.status().in_flight, 0);
    }

    #[tokio::test]
    async fn missing_agent_makes_plan_malformed() {
        // Solo hay agente de consulta: el plan de comparación no es válido.
        let orch = broken(false);
        let err = orch.handle("compare aetna vs bcbs", None).await.unwrap_err();
        assert_eq!(err.code(), "MALFORMED_PLAN");
        assert_eq!(orch.status().metrics.failed_requests, 1);
    }

    #[tokio::test]
    async fn poisoned_metrics_keep_counting() {
        let orch = orchestrator();
        orch.handle("show me aetna", None).await.unwrap();

        std::thread::scope(|scope| {
            let poisoner = scope.spawn(|| {
                let _guard = orch.metrics.lock().unwrap();
                panic!("envenenar las métricas");
            });
            assert!(poisoner.join().is_err());
        });
        assert!(orch.metrics.is_poisoned());

        assert_eq!(orch.status().metrics.total_requests, 1);
        orch.handle("show me bcbs", None).await.unwrap();
        let status = orch.status();
        assert_eq!(status.metrics.total_requests, 2);
        assert_eq!(status.metrics.successful_requests, 2);
    }
}
