//! MQTT transport (QoS 1) with per-publish acknowledgment tracking.
//!
//! rumqttc assigns packet ids inside the event loop, in the order requests
//! leave the client channel. A caller queues its ack sender and enqueues its
//! request in one synchronous step under the tracker lock, so the two queues
//! never drift apart even when the caller's future is dropped. The event
//! loop pairs each outgoing publish with the oldest queued sender and
//! resolves it when the matching PUBACK arrives.
//!
//! After a connection error rumqttc resends every unacknowledged publish,
//! with the same packet id, before any new request.

use super::{PublishError, Publisher};
use crate::error::{Result, SimError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    valid_topic, AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_PORT: u16 = 1883;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CHANNEL_CAPACITY: usize = 1024;
const MAX_INFLIGHT: u16 = 1000;
/// Retry period while the request channel is full
const SUBMIT_BACKOFF: Duration = Duration::from_millis(1);

type AckSender = oneshot::Sender<std::result::Result<(), PublishError>>;

#[derive(Default)]
struct AckTracker {
    /// Submitted, not yet seen leaving the event loop
    queued: VecDeque<AckSender>,
    /// On the wire, keyed by packet id
    in_flight: HashMap<u16, AckSender>,
    /// Sent while the previous holder of the same packet id was still
    /// unacknowledged; takes over the id on that PUBACK
    collided: HashMap<u16, AckSender>,
    /// Failed to their callers but not yet acknowledged by the broker
    abandoned: HashSet<u16>,
    /// Abandoned ids not resent since the last connection error
    awaiting_resend: HashSet<u16>,
}

impl AckTracker {
    fn sent(&mut self, pkid: u16) {
        if self.awaiting_resend.remove(&pkid) {
            return;
        }

        // The resend phase ends with the first new publish; whatever was not
        // resent by then is gone.
        for stale in self.awaiting_resend.drain() {
            self.abandoned.remove(&stale);
        }

        let Some(tx) = self.queued.pop_front() else {
            return;
        };
        if self.in_flight.contains_key(&pkid) || self.abandoned.contains(&pkid) {
            self.collided.insert(pkid, tx);
        } else {
            self.in_flight.insert(pkid, tx);
        }
    }

    fn acked(&mut self, pkid: u16) {
        match self.in_flight.remove(&pkid) {
            Some(tx) => {
                let _ = tx.send(Ok(()));
            }
            None => {
                self.abandoned.remove(&pkid);
            }
        }
        if let Some(tx) = self.collided.remove(&pkid) {
            self.in_flight.insert(pkid, tx);
        }
    }

    fn fail_in_flight(&mut self, reason: &str) {
        let failed = self.in_flight.drain().chain(self.collided.drain());
        for (pkid, tx) in failed.collect::<Vec<_>>() {
            self.abandoned.insert(pkid);
            let _ = tx.send(Err(PublishError::Connection(reason.to_string())));
        }
        self.awaiting_resend = self.abandoned.clone();
    }
}

/// Marks the event loop as gone when the driver task ends or is aborted, and
/// releases every waiting caller.
struct DriverGuard {
    closed: Arc<AtomicBool>,
    acks: Arc<Mutex<AckTracker>>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        let mut acks = self.acks.lock();
        acks.queued.clear();
        acks.in_flight.clear();
        acks.collided.clear();
    }
}

/// Publishes telemetry to an MQTT broker at QoS 1.
pub struct MqttPublisher {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    closed: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    /// Connects to the broker and waits for CONNACK.
    pub async fn connect(broker_url: &str, client_id: &str) -> Result<Self> {
        let (host, port) = parse_broker_url(broker_url)?;

        let mut opts = MqttOptions::new(client_id, host.clone(), port);
        opts.set_keep_alive(KEEP_ALIVE);
        opts.set_inflight(MAX_INFLIGHT);

        let (client, event_loop) = AsyncClient::new(opts, REQUEST_CHANNEL_CAPACITY);
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let (connected_tx, connected_rx) = oneshot::channel();

        let closed = Arc::new(AtomicBool::new(false));
        let guard = DriverGuard {
            closed: Arc::clone(&closed),
            acks: Arc::clone(&acks),
        };
        let driver = tokio::spawn({
            let acks = Arc::clone(&acks);
            async move {
                let _guard = guard;
                drive_event_loop(event_loop, acks, connected_tx).await;
            }
        });

        match tokio::time::timeout(CONNECT_TIMEOUT, connected_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => {
                driver.abort();
                return Err(SimError::Connect(reason));
            }
            Ok(Err(_)) => {
                driver.abort();
                return Err(SimError::Connect("event loop exited".to_string()));
            }
            Err(_) => {
                driver.abort();
                return Err(SimError::Connect(format!(
                    "no CONNACK from {}:{} within {:?}",
                    host, port, CONNECT_TIMEOUT
                )));
            }
        }

        info!("Connected to MQTT broker {}:{}", host, port);

        Ok(Self {
            client,
            acks,
            closed,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Queues the ack sender and enqueues the request without an await
    /// point between them. Hands the payload back when the channel is full.
    fn try_submit(&self, topic: &str, payload: Vec<u8>, tx: AckSender) -> Submit {
        let mut acks = self.acks.lock();
        if self.closed.load(Ordering::Acquire) {
            return Submit::Failed(PublishError::Connection("event loop stopped".to_string()));
        }
        match self
            .client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.clone())
        {
            Ok(()) => {
                acks.queued.push_back(tx);
                Submit::Queued
            }
            Err(ClientError::TryRequest(_)) => Submit::Full(payload, tx),
            Err(e) => Submit::Failed(e.into()),
        }
    }

    /// Sends DISCONNECT and stops the event loop.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("MQTT disconnect failed: {}", e);
        }

        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        info!("Disconnected from MQTT broker");
    }
}

enum Submit {
    Queued,
    Full(Vec<u8>, AckSender),
    Failed(PublishError),
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> std::result::Result<(), PublishError> {
        if !valid_topic(topic) {
            return Err(PublishError::Connection(format!("invalid topic '{}'", topic)));
        }

        let (tx, rx) = oneshot::channel();
        let mut pending = (payload, tx);
        loop {
            let (payload, tx) = pending;
            match self.try_submit(topic, payload, tx) {
                Submit::Queued => break,
                Submit::Full(payload, tx) => pending = (payload, tx),
                Submit::Failed(e) => return Err(e),
            }
            tokio::time::sleep(SUBMIT_BACKOFF).await;
        }

        rx.await.map_err(|_| PublishError::AckDropped)?
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    acks: Arc<Mutex<AckTracker>>,
    connected: oneshot::Sender<std::result::Result<(), String>>,
) {
    let mut connected = Some(connected);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let result = if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
                match connected.take() {
                    Some(tx) => {
                        let refused = result.is_err();
                        let _ = tx.send(result);
                        if refused {
                            return;
                        }
                    }
                    None => info!("Reconnected to MQTT broker"),
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.lock().sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.lock().acked(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT event loop stopping");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let reason = e.to_string();
                if let Some(tx) = connected.take() {
                    let _ = tx.send(Err(reason));
                    return;
                }
                warn!("MQTT connection error: {}", reason);
                acks.lock().fail_in_flight(&reason);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Splits `tcp://host:port` (scheme and port optional) into host and port.
pub fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let rest = match url.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((scheme, _)) => {
            return Err(SimError::Config(format!(
                "unsupported broker scheme '{}'",
                scheme
            )))
        }
        None => url,
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| SimError::Config(format!("invalid broker port in '{}'", url)))?;
            (host, port)
        }
        None => (rest, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(SimError::Config(format!("missing broker host in '{}'", url)));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("tcp://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt://broker.local:8883/").unwrap(),
            ("broker.local".to_string(), 8883)
        );
        assert_eq!(
            parse_broker_url("10.1.2.3").unwrap(),
            ("10.1.2.3".to_string(), 1883)
        );
        assert!(parse_broker_url("ws://localhost:9001").is_err());
        assert!(parse_broker_url("tcp://localhost:notaport").is_err());
        assert!(parse_broker_url("tcp://:1883").is_err());
    }

    #[tokio::test]
    async fn test_ack_tracker_pairs_in_order() {
        let mut tracker = AckTracker::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tracker.queued.push_back(tx1);
        tracker.queued.push_back(tx2);

        tracker.sent(7);
        tracker.sent(8);
        tracker.acked(8);
        tracker.acked(7);

        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
        assert!(tracker.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_ack_tracker_fails_in_flight_and_skips_retransmit() {
        let mut tracker = AckTracker::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tracker.queued.push_back(tx1);
        tracker.sent(1);

        tracker.fail_in_flight("connection reset");
        assert!(matches!(
            rx1.await.unwrap(),
            Err(PublishError::Connection(_))
        ));

        // Retransmission of pkid 1 must not consume the next caller's slot
        tracker.queued.push_back(tx2);
        tracker.sent(1);
        assert_eq!(tracker.queued.len(), 1);
        tracker.sent(2);
        tracker.acked(2);
        assert!(rx2.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_resend_after_reconnect_keeps_pairing() {
        let mut tracker = AckTracker::default();
        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_d, mut rx_d) = oneshot::channel();
        tracker.queued.push_back(tx_a);
        tracker.sent(1);
        tracker.fail_in_flight("connection reset");

        tracker.queued.push_back(tx_d);
        tracker.sent(1);
        tracker.sent(2);
        tracker.acked(1);
        assert!(rx_d.try_recv().is_err());
        tracker.acked(2);

        assert!(rx_d.await.unwrap().is_ok());
        assert!(tracker.queued.is_empty());
        assert!(tracker.abandoned.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_id_reused_after_connection_drop() {
        let mut tracker = AckTracker::default();
        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_d, rx_d) = oneshot::channel();
        let (tx_e, rx_e) = oneshot::channel();
        tracker.queued.push_back(tx_a);
        tracker.sent(1);
        tracker.fail_in_flight("connection reset");

        // pkid 1 is never resent; the next publish is a new one
        tracker.queued.push_back(tx_d);
        tracker.sent(2);
        tracker.acked(2);
        assert!(rx_d.await.unwrap().is_ok());
        assert!(tracker.abandoned.is_empty());

        tracker.queued.push_back(tx_e);
        tracker.sent(1);
        tracker.acked(1);
        assert!(rx_e.await.unwrap().is_ok());
        assert!(tracker.queued.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_connection_errors() {
        let mut tracker = AckTracker::default();
        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_d, rx_d) = oneshot::channel();
        tracker.queued.push_back(tx_a);
        tracker.sent(1);
        tracker.fail_in_flight("connection reset");
        tracker.sent(1);
        tracker.fail_in_flight("connection reset");

        tracker.queued.push_back(tx_d);
        tracker.sent(1);
        assert_eq!(tracker.queued.len(), 1);
        tracker.sent(2);
        tracker.acked(2);
        assert!(rx_d.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_packet_id_collision() {
        let mut tracker = AckTracker::default();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        tracker.queued.push_back(tx_a);
        tracker.sent(5);

        // rumqttc emits the queued publish before the PUBACK that freed its id
        tracker.queued.push_back(tx_b);
        tracker.sent(5);
        tracker.acked(5);
        assert!(rx_a.await.unwrap().is_ok());
        assert!(rx_b.try_recv().is_err());

        tracker.acked(5);
        assert!(rx_b.await.unwrap().is_ok());
        assert!(tracker.in_flight.is_empty());
    }

    const TOPIC: &str = "tenants/acme-clinic/devices/watch-0000/telemetry";

    fn detached(capacity: usize) -> (Arc<MqttPublisher>, EventLoop) {
        let opts = MqttOptions::new("simulator-test", "localhost", DEFAULT_PORT);
        let (client, event_loop) = AsyncClient::new(opts, capacity);
        let publisher = MqttPublisher {
            client,
            acks: Arc::new(Mutex::new(AckTracker::default())),
            closed: Arc::new(AtomicBool::new(false)),
            driver: Mutex::new(None),
        };
        (Arc::new(publisher), event_loop)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_publishes_leave_no_orphan_sender() {
        let (publisher, mut event_loop) = detached(1);
        let limit = Duration::from_millis(50);

        // Enqueued, then abandoned while waiting for its PUBACK
        let res = tokio::time::timeout(limit, publisher.publish(TOPIC, b"{}".to_vec())).await;
        assert!(res.is_err());
        // Abandoned while the request channel is full
        let res = tokio::time::timeout(limit, publisher.publish(TOPIC, b"{}".to_vec())).await;
        assert!(res.is_err());

        event_loop.clean();
        assert_eq!(event_loop.pending.len(), 1);
        assert_eq!(publisher.acks.lock().queued.len(), 1);

        let later = tokio::spawn({
            let publisher = Arc::clone(&publisher);
            async move { publisher.publish(TOPIC, b"{}".to_vec()).await }
        });
        for _ in 0..100 {
            if publisher.acks.lock().queued.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        event_loop.clean();
        assert_eq!(event_loop.pending.len(), 2);

        {
            let mut acks = publisher.acks.lock();
            acks.sent(1);
            acks.sent(2);
            acks.acked(1);
            acks.acked(2);
        }
        assert!(later.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_publish_fails_once_event_loop_stopped() {
        let (publisher, _event_loop) = detached(4);
        publisher.closed.store(true, Ordering::Release);

        let res = publisher.publish(TOPIC, b"{}".to_vec()).await;
        assert!(matches!(res, Err(PublishError::Connection(_))));
        assert!(publisher.acks.lock().queued.is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        // Port 1 on loopback is not an MQTT broker
        let res = MqttPublisher::connect("tcp://127.0.0.1:1", "simulator-test").await;
        assert!(matches!(res, Err(SimError::Connect(_))));
    }
}
