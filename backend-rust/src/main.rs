mod broadcaster;
mod handlers;
mod ingest;
mod state;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use state::{AppState, BackendConfig, SharedState};

// ─── Router ──────────────────────────────────────────────────────────────────

fn router(state: SharedState) -> Router {
    // CORS: dashboards are served from other origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/device", get(handlers::device_ws))
        .route("/ws", get(handlers::dashboard_ws))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(cors)
}

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grading_backend=info".into()),
        )
        .init();

    info!("🏭 Grading backend starting...");

    let config = BackendConfig::default();
    info!(
        "alerts below {}, client idle timeout {}s, client queue {}",
        config.alert_min_grade, config.client_idle_timeout_s, config.client_queue_depth
    );
    let addr = format!("0.0.0.0:{}", config.port);
    let app = router(AppState::new(config));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("🚀 Listening on {addr} (devices: /device, dashboards: /ws)");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fixtures::{identity, sample};
    use futures_util::{SinkExt, StreamExt};
    use grading_types::{DashboardMessage, DeviceMessage, Grade, IngestReply};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    async fn spawn_server() -> (String, SharedState) {
        spawn_server_with_idle(30).await
    }

    async fn spawn_server_with_idle(client_idle_timeout_s: u64) -> (String, SharedState) {
        let config = BackendConfig {
            port: 0,
            alert_min_grade: Grade::B,
            client_idle_timeout_s,
            client_queue_depth: 16,
            identify_timeout_s: 5,
        };
        let state = AppState::new(config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{addr}"), state)
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(t) => return t,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn device_sample_reaches_dashboard() {
        let (base, state) = spawn_server().await;

        let (mut dash, _) = tokio_tungstenite::connect_async(format!("{base}/ws")).await.unwrap();
        let first: DashboardMessage = serde_json::from_str(&next_text(&mut dash).await).unwrap();
        assert!(matches!(first, DashboardMessage::LatestSample { record: None }));

        let (mut dev, _) = tokio_tungstenite::connect_async(format!("{base}/device")).await.unwrap();
        let hello = DeviceMessage::Identify { identity: identity("dev-1", "S1") };
        dev.send(Message::Text(serde_json::to_string(&hello).unwrap())).await.unwrap();
        let welcome: IngestReply = serde_json::from_str(&next_text(&mut dev).await).unwrap();
        assert_eq!(welcome, IngestReply::Welcome { device_id: "dev-1".into() });

        let s = sample("dev-1", Grade::A, 0.8);
        let sid = s.sample_id.clone();
        let msg = DeviceMessage::Sample(Box::new(s));
        dev.send(Message::Text(serde_json::to_string(&msg).unwrap())).await.unwrap();
        let ack: IngestReply = serde_json::from_str(&next_text(&mut dev).await).unwrap();
        assert_eq!(ack, IngestReply::Ack { sample_id: sid.clone() });

        let update: DashboardMessage = serde_json::from_str(&next_text(&mut dash).await).unwrap();
        match update {
            DashboardMessage::SensorUpdate { record } => {
                assert_eq!(record.sample.sample_id, sid);
                assert_eq!(record.site_code.as_deref(), Some("S1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.connected_devices().await, 1);
    }

    #[tokio::test]
    async fn device_must_identify_first() {
        let (base, _state) = spawn_server().await;
        let (mut dev, _) = tokio_tungstenite::connect_async(format!("{base}/device")).await.unwrap();
        let msg = DeviceMessage::Sample(Box::new(sample("dev-1", Grade::A, 0.8)));
        dev.send(Message::Text(serde_json::to_string(&msg).unwrap())).await.unwrap();
        loop {
            match dev.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Text(t))) => panic!("unexpected reply {t}"),
                Some(Ok(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn dashboard_ping_gets_pong() {
        let (base, _state) = spawn_server().await;
        let (mut dash, _) = tokio_tungstenite::connect_async(format!("{base}/ws")).await.unwrap();
        next_text(&mut dash).await;
        dash.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        let reply: DashboardMessage = serde_json::from_str(&next_text(&mut dash).await).unwrap();
        assert!(matches!(reply, DashboardMessage::Pong));
    }

    #[tokio::test]
    async fn idle_dashboard_is_pinged_then_dropped_when_silent() {
        let (base, state) = spawn_server_with_idle(1).await;
        let (mut dash, _) = tokio_tungstenite::connect_async(format!("{base}/ws")).await.unwrap();
        next_text(&mut dash).await;

        let ping: DashboardMessage = serde_json::from_str(&next_text(&mut dash).await).unwrap();
        assert!(matches!(ping, DashboardMessage::Ping));
        dash.send(Message::Text(r#"{"type":"pong"}"#.into())).await.unwrap();

        // answered: still connected, so the next idle period pings again
        let again: DashboardMessage = serde_json::from_str(&next_text(&mut dash).await).unwrap();
        assert!(matches!(again, DashboardMessage::Ping));
        assert_eq!(state.broadcaster.client_count().await, 1);

        // unanswered: the server hangs up
        let closed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match dash.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(t))) => panic!("unexpected frame {t}"),
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "silent dashboard was not disconnected");
        assert_eq!(state.broadcaster.client_count().await, 0);
    }
}
