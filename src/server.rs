//! Wires the relay together: storage, policies, groups, the middleware
//! chain and the HTTP/WebSocket router.

use crate::app_state::HttpServerState;
use crate::config::RelaySettings;
use crate::groups::Groups;
use crate::handler::{self, RelayInfoDocument};
use crate::message::{ClientMessage, NostrMessageConverter, RelayMessage};
use crate::middlewares::{
    EventStoreMiddleware, EventVerifier, GroupsPolicy, LoggerMiddleware, Nip42Auth, PolicyGate,
};
use crate::policies::{standard_kind_policies, standard_policies};
use crate::policy::PolicyPipeline;
use crate::relay_store::RelayStore;
use crate::session::{ConnectionFactory, ConnectionState};
use crate::store::sqlite::SqliteStore;
use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, FromRef, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};
use wspipe::{PipelineBuilder, WebSocketHandler};

type RelayHandler = WebSocketHandler<
    ConnectionState,
    ClientMessage,
    RelayMessage,
    NostrMessageConverter,
    ConnectionFactory,
>;

#[derive(Clone)]
pub struct AppState {
    http_state: Arc<HttpServerState>,
    ws_handler: Arc<RelayHandler>,
    cancellation_token: CancellationToken,
}

impl FromRef<AppState> for Arc<HttpServerState> {
    fn from_ref(state: &AppState) -> Self {
        state.http_state.clone()
    }
}

/// A fully wired relay, ready to serve.
pub struct RelayApp {
    pub router: Router,
    pub cancellation_token: CancellationToken,
    pub store: Arc<RelayStore>,
    pub groups: Arc<Groups>,
    pub relay_pubkey: String,
}

pub async fn build(settings: RelaySettings) -> Result<RelayApp> {
    let relay_keys = Arc::new(settings.relay_keys()?);
    let relay_pubkey = relay_keys.public_key.clone();

    let sqlite = if settings.db_path == ":memory:" {
        SqliteStore::open_in_memory()?
    } else {
        SqliteStore::open(&settings.db_path)?
    };

    let mut pipeline = PolicyPipeline::new()
        .with_reject_policies(standard_policies(&settings.policies))
        .with_store(Arc::new(sqlite));
    for (kind, policy) in standard_kind_policies(&settings.policies) {
        pipeline = pipeline.with_kind_policy(kind, policy);
    }
    let pipeline = Arc::new(pipeline);
    pipeline.init_stores().await.context("store init failed")?;

    let store = Arc::new(RelayStore::new(
        pipeline.clone(),
        relay_keys,
        settings.replaceable_mode,
        settings.max_limit,
    ));

    let groups = Arc::new(
        Groups::load_groups(store.clone(), relay_pubkey.clone())
            .await
            .context("failed to load groups")?,
    );

    let relay_info = RelayInfoDocument::new(&settings.info, relay_pubkey.clone());
    let http_state = Arc::new(HttpServerState::new(groups.clone(), relay_info));

    let mut builder = PipelineBuilder::new(
        ConnectionFactory::new(settings.relay_url.clone()),
        NostrMessageConverter,
    )
    .with_channel_size(settings.websocket.channel_size)
    .with_middleware(LoggerMiddleware::new())
    .with_middleware(Nip42Auth::new(settings.relay_url.clone()))
    .with_middleware(PolicyGate::new(pipeline, relay_pubkey.clone()))
    .with_middleware(EventVerifier)
    .with_middleware(GroupsPolicy::new(groups.clone()))
    .with_middleware(EventStoreMiddleware::new(
        store.clone(),
        settings.max_subscriptions,
    ));

    if let Some(max_connections) = settings.websocket.max_connections {
        builder = builder.with_max_connections(max_connections);
    }
    if let Some(max_duration) = settings.websocket.max_connection_duration {
        builder = builder.with_max_connection_time(max_duration);
    }

    let cancellation_token = CancellationToken::new();
    let app_state = AppState {
        http_state,
        ws_handler: Arc::new(builder.build()),
        cancellation_token: cancellation_token.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/", get(root_handler))
        .route("/nostr.json", get(handler::handle_nostr_json))
        .route("/health", get(handler::handle_health))
        .layer(cors)
        .with_state(app_state);

    Ok(RelayApp {
        router,
        cancellation_token,
        store,
        groups,
        relay_pubkey,
    })
}

/// Root: WebSocket upgrades become relay sessions; plain HTTP with the
/// `application/nostr+json` accept header gets the NIP-11 document.
async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    if let Some(ws) = ws {
        debug!("websocket upgrade from {}", addr);
        return ws
            .on_upgrade(move |socket| async move {
                match state
                    .ws_handler
                    .start(socket, addr.to_string(), state.cancellation_token.clone())
                    .await
                {
                    Ok(()) => debug!("connection {} closed", addr),
                    Err(e) => error!("connection {} failed: {:?}", addr, e),
                }
            })
            .into_response();
    }

    let wants_nip11 = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/nostr+json"));

    if wants_nip11 {
        return handler::handle_nostr_json(State(state.http_state.clone()))
            .await
            .into_response();
    }

    (StatusCode::OK, "agora relay: connect with a Nostr client\n").into_response()
}

impl RelayApp {
    /// Binds and serves until the cancellation token fires.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("listening on {}", addr);

        let token = self.cancellation_token.clone();
        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("server error")
    }
}
