//! # broadcaster
//!
//! Fan-out of fused samples and alerts to connected dashboard clients.
//!
//! Each client owns a bounded `mpsc` queue of pre-serialised JSON frames; its
//! WebSocket task drains the queue. A broadcast:
//!   1. snapshots matching senders under the read lock
//!   2. `try_send`s to each one independently
//!   3. prunes every client whose send failed (closed or full) under the write lock
//!
//! Clients that vanish between steps 1 and 3 are skipped.

use std::collections::HashMap;
use std::sync::Arc;

use grading_types::{Alert, ClientFilter, DashboardMessage, SensorRecord};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ClientId = Uuid;
pub type Frame = Arc<str>;

struct ClientEntry {
    sender: mpsc::Sender<Frame>,
    filter: Option<ClientFilter>,
}

pub struct RealtimeBroadcaster {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    queue_depth: usize,
}

impl RealtimeBroadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Self { clients: RwLock::new(HashMap::new()), queue_depth: queue_depth.max(1) }
    }

    /// Add a client with no filter. The receiver is the client's outbound queue.
    pub async fn register(&self) -> (ClientId, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        let id = Uuid::new_v4();
        self.clients.write().await.insert(id, ClientEntry { sender, filter: None });
        info!("📺 Dashboard client {id} registered");
        (id, receiver)
    }

    pub async fn deregister(&self, id: &ClientId) -> bool {
        let removed = self.clients.write().await.remove(id).is_some();
        if removed {
            info!("Dashboard client {id} deregistered");
        }
        removed
    }

    /// `None` clears the filter. Returns false for unknown clients.
    pub async fn update_filter(&self, id: &ClientId, filter: Option<ClientFilter>) -> bool {
        match self.clients.write().await.get_mut(id) {
            Some(entry) => {
                debug!("client {id} filter → {filter:?}");
                entry.filter = filter;
                true
            }
            None => false,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Deliver a `sensor_update`. Returns the number of clients reached.
    pub async fn broadcast(&self, record: &SensorRecord) -> usize {
        let msg = DashboardMessage::SensorUpdate { record: Box::new(record.clone()) };
        self.fan_out(&msg, |f| f.matches_record(record)).await
    }

    /// Alerts are routed by device and site only.
    pub async fn broadcast_alert(&self, alert: &Alert) -> usize {
        let msg = DashboardMessage::Alert { alert: alert.clone() };
        self.fan_out(&msg, |f| f.matches_alert(alert)).await
    }

    async fn fan_out(&self, msg: &DashboardMessage, matches: impl Fn(&ClientFilter) -> bool) -> usize {
        let frame: Frame = match serde_json::to_string(msg) {
            Ok(s) => s.into(),
            Err(e) => {
                warn!("dashboard message not serialisable: {e}");
                return 0;
            }
        };

        let targets: Vec<(ClientId, mpsc::Sender<Frame>)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, c)| c.filter.as_ref().map_or(true, &matches))
                .map(|(id, c)| (*id, c.sender.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!("send to client {id} failed: {e}");
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for id in &dead {
                if clients.remove(id).is_some() {
                    warn!("🔌 Pruned dashboard client {id}");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fixtures::{record, sample};
    use grading_types::{AlertKind, AlertSeverity, Grade};
    use proptest::prelude::*;

    fn grade_strategy() -> impl Strategy<Value = Grade> {
        prop::sample::select(Grade::ALL.to_vec())
    }

    fn decode(frame: &str) -> DashboardMessage {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn unfiltered_client_receives_everything() {
        let b = RealtimeBroadcaster::new(8);
        let (_id, mut rx) = b.register().await;
        let r = record(sample("dev-1", Grade::C, 0.5), Some("S1"));
        assert_eq!(b.broadcast(&r).await, 1);
        match decode(&rx.recv().await.unwrap()) {
            DashboardMessage::SensorUpdate { record } => assert_eq!(record.sample.device_id, "dev-1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn filters_by_device_and_site() {
        let b = RealtimeBroadcaster::new(8);
        let (a, mut rx_a) = b.register().await;
        let (s, mut rx_s) = b.register().await;
        b.update_filter(&a, Some(ClientFilter { device_id: Some("dev-2".into()), ..Default::default() })).await;
        b.update_filter(&s, Some(ClientFilter { site_code: Some("S1".into()), ..Default::default() })).await;

        b.broadcast(&record(sample("dev-1", Grade::A, 0.8), Some("S1"))).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_s.try_recv().is_ok());

        b.broadcast(&record(sample("dev-2", Grade::A, 0.8), None)).await;
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_s.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_client_is_pruned_without_affecting_others() {
        let b = RealtimeBroadcaster::new(8);
        let (_gone, rx_gone) = b.register().await;
        let (_live, mut rx_live) = b.register().await;
        drop(rx_gone);

        let delivered = b.broadcast(&record(sample("dev-1", Grade::B, 0.7), None)).await;
        assert_eq!(delivered, 1);
        assert_eq!(b.client_count().await, 1);
        assert!(rx_live.try_recv().is_ok());
    }

    #[tokio::test]
    async fn full_queue_counts_as_failed_send() {
        let b = RealtimeBroadcaster::new(1);
        let (_id, _rx) = b.register().await;
        let r = record(sample("dev-1", Grade::B, 0.7), None);
        assert_eq!(b.broadcast(&r).await, 1);
        assert_eq!(b.broadcast(&r).await, 0);
        assert_eq!(b.client_count().await, 0);
    }

    #[tokio::test]
    async fn alerts_ignore_min_grade() {
        let b = RealtimeBroadcaster::new(8);
        let (id, mut rx) = b.register().await;
        b.update_filter(&id, Some(ClientFilter { min_grade: Some(Grade::APlus), ..Default::default() })).await;
        let alert = Alert {
            id: "a".into(),
            kind: AlertKind::RejectedProduct,
            severity: AlertSeverity::Critical,
            device_id: "dev-1".into(),
            site_code: None,
            sample_id: None,
            message: "rejected".into(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(b.broadcast_alert(&alert).await, 1);
        assert!(matches!(decode(&rx.recv().await.unwrap()), DashboardMessage::Alert { .. }));
    }

    #[tokio::test]
    async fn unknown_client_filter_update_is_rejected() {
        let b = RealtimeBroadcaster::new(8);
        assert!(!b.update_filter(&Uuid::new_v4(), None).await);
        assert!(!b.deregister(&Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn concurrent_deregistration_does_not_fail_broadcast() {
        let b = Arc::new(RealtimeBroadcaster::new(64));
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..20 {
            let (id, rx) = b.register().await;
            ids.push(id);
            receivers.push(rx);
        }
        let remover = {
            let b = b.clone();
            tokio::spawn(async move {
                for id in ids {
                    b.deregister(&id).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        let r = record(sample("dev-1", Grade::A, 0.8), None);
        for _ in 0..20 {
            let delivered = b.broadcast(&r).await;
            assert!(delivered <= 20);
            tokio::task::yield_now().await;
        }
        remover.await.unwrap();
        assert_eq!(b.client_count().await, 0);
    }

    proptest! {
        #[test]
        fn min_grade_filter_never_admits_worse_results(result in grade_strategy(), min in grade_strategy()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let b = RealtimeBroadcaster::new(4);
                let (id, mut rx) = b.register().await;
                b.update_filter(&id, Some(ClientFilter { min_grade: Some(min), ..Default::default() })).await;
                b.broadcast(&record(sample("dev-1", result, 0.5), None)).await;
                let got = rx.try_recv().is_ok();
                prop_assert_eq!(got, result.rank() <= min.rank());
                Ok(())
            })?;
        }
    }
}
