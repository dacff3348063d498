use std::{future::IntoFuture, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::Notify;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taxonomy_query_webapp::{api, app_state::AppState, config::AppConfig, ingest, vocabulary::Vocabulary};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración y vocabulario
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;
    let vocabulary = Vocabulary::load(cfg.vocabulary_path.as_deref()).context("Error al cargar el vocabulario")?;

    // 3. Cargar los datos en memoria
    info!("Cargando datos desde {}", cfg.data_dir.display());
    let corpus = ingest::load_directory(&cfg.data_dir, cfg.schema_sample_size)
        .with_context(|| format!("Error al cargar el directorio de datos {}", cfg.data_dir.display()))?;
    info!("{}", corpus.summary);
    if corpus.is_empty() {
        warn!("No se ha cargado ninguna tabla; todas las consultas devolverán cero resultados.");
    }

    // 4. Taxonomía, agentes y estado compartido
    let (app_state, shutdown_rx) = AppState::build(cfg.clone(), corpus, vocabulary);

    // 5. Router de la API y, opcionalmente, ficheros estáticos
    let mut app = Router::new().merge(api::create_router(app_state.clone()));
    if let Some(dir) = &cfg.static_dir {
        info!("Sirviendo ficheros estáticos desde {}", dir.display());
        app = app.fallback_service(ServeDir::new(dir));
    }
    let app = app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    // 6. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    // Apagado ordenado: /api/shutdown o Ctrl-C. Tras la señal quedan
    // `shutdown_grace` segundos para terminar las peticiones en curso.
    let signalled = Arc::new(Notify::new());
    let shutdown_state = app_state.clone();
    let notify = signalled.clone();
    let graceful = async move {
        tokio::select! {
            _ = shutdown_rx => info!("Señal de apagado recibida, iniciando cierre del servidor."),
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C recibido, iniciando cierre del servidor."),
        }
        shutdown_state.begin_shutdown();
        notify.notify_one();
    };

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .into_future();
    let grace = cfg.shutdown_grace;
    tokio::select! {
        result = server => result.context("Error en el servidor")?,
        _ = async {
            signalled.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(
                in_flight = app_state.orchestrator.status().in_flight,
                "Tiempo de cierre agotado; se fuerza el apagado."
            );
        }
    }

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
