//! uplink.rs — Device → ingestion transport
//!
//! `Uplink` is what the session drives; `WsUplink` implements it over a
//! WebSocket to the backend's `/device` endpoint:
//!   - join_network: simulated Wi-Fi association (delay + failure probability)
//!   - connect:      WebSocket open with timeout
//!   - handshake:    `identify` → wait for `welcome`
//!   - send_sample:  `sample` → wait for the matching `ack` / `nack`
//!   - notify:       fire-and-forget (`heartbeat`, `fault`)
//!
//! Any transport error drops the socket; the session decides when to retry.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use grading_types::{DeviceIdentity, DeviceMessage, IngestReply, SampleMessage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::LinkError;

/// Backend verdict on one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Acked,
    Rejected(String),
}

#[async_trait]
pub trait Uplink: Send {
    async fn join_network(&mut self) -> Result<(), LinkError>;
    async fn connect(&mut self) -> Result<(), LinkError>;
    async fn handshake(&mut self, identity: &DeviceIdentity) -> Result<(), LinkError>;
    async fn send_sample(&mut self, sample: &SampleMessage) -> Result<Delivery, LinkError>;
    async fn notify(&mut self, message: &DeviceMessage) -> Result<(), LinkError>;
    async fn close(&mut self);
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub url: String,
    pub join_delay_ms: u64,
    pub join_failure_probability: f64,
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3001/device".into(),
            join_delay_ms: 200,
            join_failure_probability: 0.0,
            connect_timeout_ms: 3_000,
            ack_timeout_ms: 2_000,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsUplink {
    cfg: UplinkConfig,
    stream: Option<WsStream>,
    rng: StdRng,
}

impl WsUplink {
    pub fn new(cfg: UplinkConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { cfg, stream: None, rng }
    }

    fn url(&self) -> String {
        if self.cfg.url.starts_with("ws://") || self.cfg.url.starts_with("wss://") {
            self.cfg.url.clone()
        } else {
            format!("ws://{}", self.cfg.url)
        }
    }

    async fn write(&mut self, message: &DeviceMessage) -> Result<(), LinkError> {
        let text = serde_json::to_string(message).map_err(|e| LinkError::Encode(e.to_string()))?;
        let stream = self.stream.as_mut().ok_or(LinkError::NotConnected)?;
        if let Err(e) = stream.send(Message::Text(text)).await {
            self.stream = None;
            return Err(LinkError::Send(e.to_string()));
        }
        Ok(())
    }

    /// Wait for the first reply accepted by `pick`, skipping everything else.
    async fn await_reply<T>(&mut self, pick: impl Fn(IngestReply) -> Option<T>) -> Result<T, LinkError> {
        let limit = Duration::from_millis(self.cfg.ack_timeout_ms);
        let deadline = Instant::now() + limit;
        loop {
            let stream = self.stream.as_mut().ok_or(LinkError::NotConnected)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match timeout(remaining, stream.next()).await {
                Err(_) => return Err(LinkError::AckTimeout(self.cfg.ack_timeout_ms)),
                Ok(None) => {
                    self.stream = None;
                    return Err(LinkError::Send("connection closed by backend".into()));
                }
                Ok(Some(Err(e))) => {
                    self.stream = None;
                    return Err(LinkError::Send(e.to_string()));
                }
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                Message::Text(text) => match serde_json::from_str::<IngestReply>(&text) {
                    Ok(reply) => {
                        if let Some(v) = pick(reply) {
                            return Ok(v);
                        }
                    }
                    Err(e) => debug!("ignoring unparseable reply: {e}"),
                },
                Message::Close(_) => {
                    self.stream = None;
                    return Err(LinkError::Send("connection closed by backend".into()));
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl Uplink for WsUplink {
    async fn join_network(&mut self) -> Result<(), LinkError> {
        sleep(Duration::from_millis(self.cfg.join_delay_ms)).await;
        let p = self.cfg.join_failure_probability.clamp(0.0, 1.0);
        if self.rng.gen_bool(p) {
            return Err(LinkError::Network("association rejected by access point".into()));
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), LinkError> {
        let url = self.url();
        let limit = Duration::from_millis(self.cfg.connect_timeout_ms);
        let (stream, _) = match timeout(limit, connect_async(url.as_str())).await {
            Err(_) => return Err(LinkError::Connect { url, reason: "timed out".into() }),
            Ok(Err(e)) => return Err(LinkError::Connect { url, reason: e.to_string() }),
            Ok(Ok(pair)) => pair,
        };
        info!("🔌 Uplink connected to {url}");
        self.stream = Some(stream);
        Ok(())
    }

    async fn handshake(&mut self, identity: &DeviceIdentity) -> Result<(), LinkError> {
        self.write(&DeviceMessage::Identify { identity: identity.clone() }).await?;
        let expected = identity.device_id.clone();
        let welcomed = self
            .await_reply(|r| match r {
                IngestReply::Welcome { device_id } => Some(device_id),
                _ => None,
            })
            .await?;
        if welcomed != expected {
            self.stream = None;
            return Err(LinkError::Handshake(format!("welcomed as `{welcomed}`, expected `{expected}`")));
        }
        Ok(())
    }

    async fn send_sample(&mut self, sample: &SampleMessage) -> Result<Delivery, LinkError> {
        self.write(&DeviceMessage::Sample(Box::new(sample.clone()))).await?;
        let id = sample.sample_id.clone();
        self.await_reply(move |r| match r {
            IngestReply::Ack { sample_id } if sample_id == id => Some(Delivery::Acked),
            IngestReply::Nack { sample_id, reason } if sample_id == id => Some(Delivery::Rejected(reason)),
            _ => None,
        })
        .await
    }

    async fn notify(&mut self, message: &DeviceMessage) -> Result<(), LinkError> {
        self.write(message).await
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_connection_fails_fast() {
        let mut up = WsUplink::new(UplinkConfig::default(), Some(1));
        let msg = DeviceMessage::Fault { device_id: "d".into(), reason: "x".into() };
        assert_eq!(up.notify(&msg).await, Err(LinkError::NotConnected));
        assert!(!up.is_connected());
    }

    #[tokio::test]
    async fn join_can_be_rejected() {
        let cfg = UplinkConfig { join_delay_ms: 0, join_failure_probability: 1.0, ..Default::default() };
        let mut up = WsUplink::new(cfg, Some(1));
        assert!(matches!(up.join_network().await, Err(LinkError::Network(_))));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_a_connect_error() {
        let cfg = UplinkConfig { url: "127.0.0.1:9".into(), connect_timeout_ms: 500, ..Default::default() };
        let mut up = WsUplink::new(cfg, None);
        assert!(matches!(up.connect().await, Err(LinkError::Connect { .. })));
    }
}
