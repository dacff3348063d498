//! Errores tipados de agentes y orquestador, con un código estable que la
//! API devuelve junto al mensaje.

use thiserror::Error;

use crate::agents::AgentResult;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("El agente '{agent}' no soporta la acción '{action}'")]
    UnsupportedAction { agent: String, action: String },

    #[error("Falta el parámetro requerido: {0}")]
    MissingParameter(String),

    #[error("El paso '{agent}:{action}' superó el tiempo límite de {timeout_ms} ms")]
    Timeout {
        agent: String,
        action: String,
        timeout_ms: u64,
    },

    #[error("Error de ejecución: {0}")]
    Execution(String),
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::UnsupportedAction { .. } => "UNSUPPORTED_ACTION",
            AgentError::MissingParameter(_) => "MISSING_PARAMETER",
            AgentError::Timeout { .. } => "STEP_TIMEOUT",
            AgentError::Execution(_) => "EXECUTION_FAILED",
        }
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("La consulta está vacía")]
    EmptyQuery,

    #[error("Plan de ejecución inválido: {0}")]
    MalformedPlan(String),

    #[error("El servicio se está cerrando y no acepta nuevas consultas")]
    ShuttingDown,

    #[error("Falló el paso {step} ({}:{}): {source}", .result.agent, .result.action)]
    StepFailed {
        step: usize,
        result: Box<AgentResult>,
        #[source]
        source: AgentError,
    },
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::EmptyQuery => "INVALID_REQUEST",
            OrchestratorError::MalformedPlan(_) => "MALFORMED_PLAN",
            OrchestratorError::ShuttingDown => "SHUTTING_DOWN",
            OrchestratorError::StepFailed { source, .. } => source.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = AgentError::UnsupportedAction {
            agent: "query".into(),
            action: "delete".into(),
        };
        assert_eq!(err.code(), "UNSUPPORTED_ACTION");
        assert!(err.to_string().contains("delete"));
        assert_eq!(OrchestratorError::EmptyQuery.code(), "INVALID_REQUEST");
        assert_eq!(OrchestratorError::MalformedPlan("x".into()).code(), "MALFORMED_PLAN");
    }
}
