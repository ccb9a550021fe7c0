use crate::callstate::{CallStateStore, MemoryCallStateStore};
use crate::config::Config;
use crate::dispatch::CallEventDispatcher;
use crate::routing::RoutingDirectory;
use crate::vapi::{VapiClient, VoiceAgent};
use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub dispatcher: CallEventDispatcher,
    pub store: Arc<dyn CallStateStore>,
    pub token: CancellationToken,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    config: Option<Config>,
    voice_agent: Option<Arc<dyn VoiceAgent>>,
    store: Option<Arc<dyn CallStateStore>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            voice_agent: None,
            store: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the voice-agent backend, used by tests.
    pub fn voice_agent(mut self, agent: Arc<dyn VoiceAgent>) -> Self {
        self.voice_agent = Some(agent);
        self
    }

    /// Override the call-state store, e.g. to plug in a durable one.
    pub fn call_state_store(mut self, store: Arc<dyn CallStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCallStateStore::new()));
        let agent = self
            .voice_agent
            .unwrap_or_else(|| Arc::new(VapiClient::new(&config.vapi)));
        let directory = RoutingDirectory::from_config(&config.routing, &config.vapi);
        let dispatcher = CallEventDispatcher::new(
            directory,
            store.clone(),
            agent,
            config.vapi.fallback_enabled,
            config.vapi.assistant_id.clone(),
        );

        Ok(Arc::new(AppStateInner {
            config,
            dispatcher,
            store,
            token: CancellationToken::new(),
        }))
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn run(state: AppState) -> Result<()> {
    let token = state.token.clone();
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let app = create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    let http_task = axum::serve(listener, app.into_make_service());
    select! {
        result = http_task => {
            if let Err(e) = result {
                return Err(anyhow::anyhow!("Server error: {}", e));
            }
            info!("Server shut down gracefully");
        }
        _ = token.cancelled() => {
            info!("Shutting down due to cancellation");
        }
    }
    Ok(())
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    crate::handler::router()
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
