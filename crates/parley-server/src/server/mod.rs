use crate::config::ServerConfig;
use crate::db::Database;
use anyhow::Result;
use axum::{routing::get, Router};
use parley_relay::Relay;
use std::{sync::Arc, time::Duration};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

pub mod routes;

/// Server application state
pub struct AppState {
    /// Chat relay shared by every connection
    pub relay: Arc<Relay>,
    /// User directory database
    pub db: Database,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, db: Database) -> Self {
        Self { relay, db }
    }
}

/// Start the HTTP server and run until a shutdown signal arrives.
///
/// On shutdown every chat connection is closed, then the server waits up to
/// the configured drain timeout for sessions to finish their teardown.
pub async fn start(config: &ServerConfig, state: Arc<AppState>) -> Result<()> {
    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("Starting Axum HTTP server on {}", listener.local_addr()?);

    let relay = Arc::clone(&state.relay);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("HTTP server received shutdown signal, closing chat connections");
            relay.shutdown();
        })
        .await?;

    drain(&state.relay, config.drain_timeout()).await;
    Ok(())
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_handler))
        .route("/ws", get(routes::websocket::websocket_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Wait for every session to leave the registry, at most `timeout`.
async fn drain(relay: &Relay, timeout: Duration) {
    let drained = async {
        while !relay.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    match tokio::time::timeout(timeout, drained).await {
        Ok(()) => info!("All chat connections drained"),
        Err(_) => warn!(
            remaining = relay.registry().len(),
            "Drain timeout elapsed with connections still registered"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{JwtIdentityVerifier, LibSqlUserDirectory, TokenValidator};
    use crate::db::MigrationRunner;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use jsonwebtoken::{encode, get_current_timestamp, Algorithm, EncodingKey, Header};
    use futures::{SinkExt, StreamExt};
    use parley_relay::{Connection, Identity, RelayConfig, StaticVerifier};
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use tower::ServiceExt;

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const SECRET: &str = "test-secret";

    async fn create_test_state() -> Arc<AppState> {
        let config = ServerConfig::test_config();
        let db = Database::in_memory("test-users").await.unwrap();
        MigrationRunner::users().run(&db).await.unwrap();

        let directory = LibSqlUserDirectory::new(db.clone());
        directory.insert("alice").await.unwrap();
        directory.insert("bob").await.unwrap();

        let validator =
            TokenValidator::new(config.jwt_secret.as_bytes(), &config.allowed_algorithms).unwrap();
        let verifier = JwtIdentityVerifier::new(validator, directory);
        let relay = Relay::new(Arc::new(verifier), config.relay_config());

        Arc::new(AppState::new(Arc::new(relay), db))
    }

    fn mint(alg: Algorithm, claims: serde_json::Value) -> String {
        encode(
            &Header::new(alg),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn ws_request(cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/ws");
        if let Some(token) = cookie {
            builder = builder.header(header::COOKIE, format!("Authorization={}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn valid_token(user_id: i64) -> String {
        mint(
            Algorithm::HS256,
            json!({ "sub": user_id, "exp": get_current_timestamp() + 60 }),
        )
    }

    async fn serve(state: Arc<AppState>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });
        addr
    }

    async fn ws_connect(addr: SocketAddr, token: &str) -> WsClient {
        let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Cookie", format!("Authorization={}", token).parse().unwrap());
        let (socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        socket
    }

    async fn next_line(client: &mut WsClient) -> String {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            if let WsMessage::Text(_) = message {
                return message.to_text().unwrap().to_string();
            }
        }
    }

    async fn wait_for_participants(state: &AppState, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while state.relay.registry().len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = create_test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "parley-server");
        assert_eq!(json["connections"], 0);
        assert_eq!(json["participants"], json!([]));
    }

    #[tokio::test]
    async fn test_chat_over_websocket() {
        let state = create_test_state().await;
        let addr = serve(Arc::clone(&state)).await;

        let mut alice = ws_connect(addr, &valid_token(1)).await;
        assert_eq!(next_line(&mut alice).await, "System: alice joined the chat");

        let mut bob = ws_connect(addr, &valid_token(2)).await;
        assert_eq!(next_line(&mut bob).await, "System: bob joined the chat");
        assert_eq!(next_line(&mut alice).await, "System: bob joined the chat");

        let health = create_router(Arc::clone(&state))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = json_body(health).await;
        assert_eq!(json["connections"], 2);
        assert_eq!(json["participants"], json!(["alice", "bob"]));

        alice.send(WsMessage::text("hi")).await.unwrap();
        assert_eq!(next_line(&mut alice).await, "alice: hi");
        assert_eq!(next_line(&mut bob).await, "alice: hi");

        // No close handshake: the TCP connection just goes away.
        drop(bob);
        assert_eq!(next_line(&mut alice).await, "System: bob left the chat");
        wait_for_participants(&state, 1).await;

        alice.close(None).await.unwrap();
        wait_for_participants(&state, 0).await;
    }

    #[tokio::test]
    async fn test_rejected_websocket_never_joins() {
        let state = create_test_state().await;
        let addr = serve(Arc::clone(&state)).await;

        let mut alice = ws_connect(addr, &valid_token(1)).await;
        assert_eq!(next_line(&mut alice).await, "System: alice joined the chat");

        let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Cookie", "Authorization=garbage".parse().unwrap());
        assert!(tokio_tungstenite::connect_async(request).await.is_err());

        alice.send(WsMessage::text("still here")).await.unwrap();
        assert_eq!(next_line(&mut alice).await, "alice: still here");
        assert_eq!(state.relay.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_websockets() {
        let state = create_test_state().await;
        let addr = serve(Arc::clone(&state)).await;

        let mut alice = ws_connect(addr, &valid_token(1)).await;
        assert_eq!(next_line(&mut alice).await, "System: alice joined the chat");

        state.relay.shutdown();

        wait_for_participants(&state, 0).await;
        let ended = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(Ok(message)) = alice.next().await {
                if message.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(ended.is_ok());
    }

    #[tokio::test]
    async fn test_ws_without_cookie_is_unauthorized() {
        let state = create_test_state().await;
        let app = create_router(Arc::clone(&state));

        let response = app.oneshot(ws_request(None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "missing_credential");
        assert!(state.relay.registry().is_empty());
    }

    #[tokio::test]
    async fn test_ws_with_garbage_token_is_unauthorized() {
        let state = create_test_state().await;
        let app = create_router(Arc::clone(&state));

        let response = app.oneshot(ws_request(Some("garbage"))).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "malformed_token");
        assert!(state.relay.registry().is_empty());
    }

    #[tokio::test]
    async fn test_ws_with_expired_token_is_unauthorized() {
        let state = create_test_state().await;
        let app = create_router(Arc::clone(&state));
        let token = mint(
            Algorithm::HS256,
            json!({ "sub": 1, "exp": get_current_timestamp() - 60 }),
        );

        let response = app.oneshot(ws_request(Some(&token))).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "token_expired");
    }

    #[tokio::test]
    async fn test_ws_with_untrusted_algorithm_is_unauthorized() {
        let state = create_test_state().await;
        let app = create_router(Arc::clone(&state));
        let token = mint(
            Algorithm::HS512,
            json!({ "sub": 1, "exp": get_current_timestamp() + 60 }),
        );

        let response = app.oneshot(ws_request(Some(&token))).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "untrusted_algorithm");
    }

    #[tokio::test]
    async fn test_ws_with_unknown_user_is_unauthorized() {
        let state = create_test_state().await;
        let app = create_router(Arc::clone(&state));
        let token = mint(
            Algorithm::HS256,
            json!({ "sub": 999, "exp": get_current_timestamp() + 60 }),
        );

        let response = app.oneshot(ws_request(Some(&token))).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "unknown_subject");
    }

    #[tokio::test]
    async fn test_ws_valid_token_without_upgrade_is_rejected() {
        let state = create_test_state().await;
        let app = create_router(Arc::clone(&state));
        let token = mint(
            Algorithm::HS256,
            json!({ "sub": 1, "exp": get_current_timestamp() + 60 }),
        );

        // Authenticated, but a plain GET cannot be upgraded.
        let response = app.oneshot(ws_request(Some(&token))).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.relay.registry().is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_for_registry() {
        let relay = Relay::new(Arc::new(StaticVerifier::new()), RelayConfig::default());
        let (conn, _outbound) = Connection::open(1);
        relay.registry().register(conn.clone(), Identity::new("alice"));

        // Times out while the entry is still there.
        drain(&relay, Duration::from_millis(100)).await;
        assert_eq!(relay.registry().len(), 1);

        relay.registry().unregister(conn.id());
        tokio::time::timeout(Duration::from_secs(1), drain(&relay, Duration::from_secs(5)))
            .await
            .unwrap();
    }
}
