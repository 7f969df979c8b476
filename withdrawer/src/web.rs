use crate::config::WebUIConfig;
use crate::session::SessionSnapshot;
use axum::extract::State;
use axum::{serve, Json};
use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
struct WebServerState {
    session_receiver: watch::Receiver<SessionSnapshot>,
}

async fn session_state(State(state): State<WebServerState>) -> Json<SessionSnapshot> {
    Json(state.session_receiver.borrow().clone())
}

fn router(session_receiver: watch::Receiver<SessionSnapshot>) -> axum::Router {
    axum::Router::new()
        .route("/health", axum::routing::get(|| async { "OK" }))
        .route("/state", axum::routing::get(session_state))
        .with_state(WebServerState { session_receiver })
}

/// Starts the status server. Returns an error if the listener cannot be
/// bound; the returned future serves until dropped.
pub async fn start_web_server(
    config: WebUIConfig,
    session_receiver: watch::Receiver<SessionSnapshot>,
) -> anyhow::Result<BoxFuture<'static, anyhow::Result<()>>> {
    let tcp_listener = TcpListener::bind(&format!("{}:{}", config.host, config.port)).await?;
    tracing::info!(address = %tcp_listener.local_addr()?, "serving session status");
    Ok(serve_on(tcp_listener, session_receiver))
}

fn serve_on(
    tcp_listener: TcpListener,
    session_receiver: watch::Receiver<SessionSnapshot>,
) -> BoxFuture<'static, anyhow::Result<()>> {
    use futures::FutureExt;

    async move {
        serve(tcp_listener, router(session_receiver)).await?;
        anyhow::Ok(())
    }
    .boxed()
}
