//! The live MQTT session: connection lifecycle, ack correlation, and
//! the in-flight window.

use super::{Endpoint, PublishError, Publisher};
use crate::config::defaults::{
    MAX_IN_FLIGHT, MQTT_CHANNEL_CAPACITY, MQTT_KEEP_ALIVE, PUBLISH_TIMEOUT,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between I/O loop polls while the broker is unreachable, so a
/// dead link does not spin the loop.
const RECONNECT_POLL_PAUSE: Duration = Duration::from_secs(2);

/// Callback invoked with the new link state whenever `connected` flips.
pub type TransitionCallback = Box<dyn Fn(bool) + Send + Sync>;

type AckResult = Result<(), PublishError>;

/// Registration messages from publishers to the I/O loop.
enum WaiterMsg {
    /// A QoS>0 publish is about to be handed to the client; pair its
    /// waiter with the next packet id the event loop assigns.
    Register(oneshot::Sender<AckResult>),
    /// The hand-off to the client failed after registration; discard
    /// the most recent unpaired waiter.
    Revoke,
}

/// State shared between the session handle and its I/O loop task.
struct SessionShared {
    connected: AtomicBool,
    in_flight: AtomicUsize,
    transitions: StdMutex<Vec<TransitionCallback>>,
}

impl SessionShared {
    fn set_connected(&self, up: bool) {
        let was = self.connected.swap(up, Ordering::SeqCst);
        if was == up {
            return;
        }
        if up {
            info!("MQTT connected");
        } else {
            warn!("MQTT disconnected");
        }
        let callbacks = match self.transitions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for callback in callbacks.iter() {
            callback(up);
        }
    }

    /// Claim an in-flight slot, failing fast when the window is full.
    fn try_acquire_slot(&self) -> Result<(), PublishError> {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= MAX_IN_FLIGHT {
                return Err(PublishError::MaxInFlight(current));
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn release_slot(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything that exists only while a session is up.
struct ActiveSession {
    client: AsyncClient,
    waiters: mpsc::UnboundedSender<WaiterMsg>,
    /// Serialises register-then-hand-off so waiter order always matches
    /// the event loop's request order.
    publish_order: Arc<Mutex<()>>,
    cancel: CancellationToken,
    io_task: JoinHandle<()>,
}

/// The MQTT session manager. Cheap to clone via `Arc` by the owner;
/// all methods take `&self`.
pub struct MqttSession {
    client_id: String,
    endpoint: StdMutex<Option<Endpoint>>,
    active: Mutex<Option<ActiveSession>>,
    shared: Arc<SessionShared>,
}

impl MqttSession {
    pub fn new(device_tag: &str) -> Self {
        Self {
            client_id: format!("aura-tracker-{device_tag}"),
            endpoint: StdMutex::new(None),
            active: Mutex::new(None),
            shared: Arc::new(SessionShared {
                connected: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                transitions: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// (Re)set the target endpoint. Idempotent; if a live session points
    /// at a different endpoint it is torn down so the next `connect()`
    /// builds a fresh one.
    pub async fn configure(&self, endpoint: Endpoint) {
        let changed = {
            let mut current = self.lock_endpoint();
            if current.as_ref() == Some(&endpoint) {
                false
            } else {
                info!(endpoint = %endpoint, "MQTT endpoint configured");
                *current = Some(endpoint);
                true
            }
        };

        if changed {
            // Any live session was built against the old endpoint;
            // tear it down so the next connect() uses the new one.
            self.disconnect().await;
        }
    }

    /// Issue a connect attempt. No-op when already connected; when a
    /// session exists but the link is down, the I/O loop is already
    /// retrying and this returns immediately. Callers verify with
    /// [`is_connected`](Self::is_connected) after a grace period.
    pub async fn connect(&self) -> Result<(), PublishError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            debug!("connect(): session already active");
            return Ok(());
        }

        let endpoint = self
            .lock_endpoint()
            .clone()
            .ok_or_else(|| PublishError::Other("no endpoint configured".to_string()))?;

        let mut options =
            MqttOptions::new(self.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        options.set_clean_session(false);

        let (client, eventloop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);
        let (waiter_tx, waiter_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let io_task = tokio::spawn(run_io_loop(
            eventloop,
            Arc::clone(&self.shared),
            waiter_rx,
            cancel.clone(),
        ));

        info!(endpoint = %endpoint, "MQTT connect attempt issued");
        *active = Some(ActiveSession {
            client,
            waiters: waiter_tx,
            publish_order: Arc::new(Mutex::new(())),
            cancel,
            io_task,
        });

        Ok(())
    }

    /// Tear down the session. Safe to call when not connected.
    pub async fn disconnect(&self) {
        let session = { self.active.lock().await.take() };
        let Some(session) = session else {
            return;
        };

        // Best-effort graceful DISCONNECT before the loop is cancelled.
        let _ = session.client.disconnect().await;
        session.cancel.cancel();
        if let Err(e) = session.io_task.await {
            warn!(error = %e, "MQTT I/O task did not exit cleanly");
        }
        self.shared.set_connected(false);
        info!("MQTT session closed");
    }

    /// Register a connection-transition observer. Callbacks run on the
    /// I/O loop and must not block.
    pub fn on_transition(&self, callback: TransitionCallback) {
        match self.shared.transitions.lock() {
            Ok(mut guard) => guard.push(callback),
            Err(poisoned) => poisoned.into_inner().push(callback),
        }
    }

    /// Outstanding unacknowledged publishes.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// The configured endpoint, if any.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.lock_endpoint().clone()
    }

    fn lock_endpoint(&self) -> std::sync::MutexGuard<'_, Option<Endpoint>> {
        match self.endpoint.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn publish_acked(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> Result<(), PublishError> {
        let (client, waiters, order) = {
            let active = self.active.lock().await;
            let session = active.as_ref().ok_or(PublishError::NotConnected)?;
            (
                session.client.clone(),
                session.waiters.clone(),
                Arc::clone(&session.publish_order),
            )
        };

        self.shared.try_acquire_slot()?;

        let (tx, rx) = oneshot::channel();
        {
            // Registration and hand-off must be adjacent in the request
            // stream or ack pairing would cross between publishers.
            let _ordered = order.lock().await;

            if waiters.send(WaiterMsg::Register(tx)).is_err() {
                self.shared.release_slot();
                return Err(PublishError::Other("session closing".to_string()));
            }
            if let Err(e) = client.publish(topic, qos, false, payload.to_vec()).await {
                let _ = waiters.send(WaiterMsg::Revoke);
                self.shared.release_slot();
                return Err(PublishError::Other(e.to_string()));
            }
        }

        match tokio::time::timeout(PUBLISH_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            // I/O loop went away with the waiter still registered
            Ok(Err(_)) => Err(PublishError::Other("session closed mid-flight".to_string())),
            // The slot stays claimed until the ack (or a link error)
            // resolves it inside the I/O loop.
            Err(_) => Err(PublishError::Timeout),
        }
    }
}

#[async_trait]
impl Publisher for MqttSession {
    async fn publish_with_result(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }

        match qos_level(qos) {
            QoS::AtMostOnce => {
                let client = {
                    let active = self.active.lock().await;
                    active
                        .as_ref()
                        .map(|session| session.client.clone())
                        .ok_or(PublishError::NotConnected)?
                };
                client
                    .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
                    .await
                    .map_err(|e| PublishError::Other(e.to_string()))
            }
            level => self.publish_acked(topic, payload, level).await,
        }
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) {
        if let Err(e) = self.publish_with_result(topic, payload, qos).await {
            debug!(topic = %topic, error = %e, "Fire-and-forget publish dropped");
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

// ============================================================================
// I/O Loop
// ============================================================================

/// Pairs publish waiters with broker acknowledgments.
///
/// rumqttc assigns packet ids in request order for a single client, and
/// the session serialises registration against hand-off, so FIFO
/// pairing of `Outgoing::Publish` events with registered waiters is
/// exact. QoS-0 publishes surface as pkid 0 and are ignored here.
struct AckTable {
    unpaired: VecDeque<oneshot::Sender<AckResult>>,
    pending: HashMap<u16, oneshot::Sender<AckResult>>,
}

impl AckTable {
    fn new() -> Self {
        Self {
            unpaired: VecDeque::new(),
            pending: HashMap::new(),
        }
    }

    fn register(&mut self, waiter: oneshot::Sender<AckResult>) {
        self.unpaired.push_back(waiter);
    }

    fn revoke(&mut self) {
        self.unpaired.pop_back();
    }

    fn assign(&mut self, pkid: u16) {
        if let Some(waiter) = self.unpaired.pop_front() {
            self.pending.insert(pkid, waiter);
        } else {
            warn!(pkid, "Outgoing publish with no registered waiter");
        }
    }

    fn complete(&mut self, pkid: u16) -> Option<oneshot::Sender<AckResult>> {
        self.pending.remove(&pkid)
    }

    /// Fail every outstanding waiter; returns how many were resolved.
    fn fail_all(&mut self, error: &PublishError) -> usize {
        let mut resolved = 0;
        for waiter in self.unpaired.drain(..).chain(self.pending.drain().map(|(_, w)| w)) {
            let _ = waiter.send(Err(error.clone()));
            resolved += 1;
        }
        resolved
    }
}

async fn run_io_loop(
    mut eventloop: EventLoop,
    shared: Arc<SessionShared>,
    mut waiter_rx: mpsc::UnboundedReceiver<WaiterMsg>,
    cancel: CancellationToken,
) {
    let mut acks = AckTable::new();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                let dropped = acks.fail_all(&PublishError::Other("session closed".to_string()));
                for _ in 0..dropped {
                    shared.release_slot();
                }
                shared.set_connected(false);
                debug!("MQTT I/O loop cancelled");
                return;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                shared.set_connected(true);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                shared.set_connected(false);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                drain_waiters(&mut acks, &mut waiter_rx);
                if let Some(waiter) = acks.complete(ack.pkid) {
                    shared.release_slot();
                    let _ = waiter.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                // QoS 2 completion; same accounting as PubAck.
                drain_waiters(&mut acks, &mut waiter_rx);
                if let Some(waiter) = acks.complete(comp.pkid) {
                    shared.release_slot();
                    let _ = waiter.send(Ok(()));
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                drain_waiters(&mut acks, &mut waiter_rx);
                if pkid != 0 {
                    acks.assign(pkid);
                }
            }
            Ok(_) => {}
            Err(e) => {
                shared.set_connected(false);
                drain_waiters(&mut acks, &mut waiter_rx);
                let dropped =
                    acks.fail_all(&PublishError::Other(format!("connection error: {e}")));
                for _ in 0..dropped {
                    shared.release_slot();
                }
                debug!(error = %e, "MQTT connection error, will retry");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        shared.set_connected(false);
                        return;
                    }
                    _ = tokio::time::sleep(RECONNECT_POLL_PAUSE) => {}
                }
            }
        }
    }
}

/// Pull any registrations that arrived since the last event, keeping
/// the ack table current before pairing or failing waiters.
fn drain_waiters(acks: &mut AckTable, waiter_rx: &mut mpsc::UnboundedReceiver<WaiterMsg>) {
    while let Ok(msg) = waiter_rx.try_recv() {
        match msg {
            WaiterMsg::Register(waiter) => acks.register(waiter),
            WaiterMsg::Revoke => acks.revoke(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_fails_fast_when_never_connected() {
        let session = MqttSession::new("TRK-TEST");
        let result = session.publish_with_result("t", b"{}", 1).await;
        assert!(matches!(result, Err(PublishError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_requires_endpoint() {
        let session = MqttSession::new("TRK-TEST");
        assert!(session.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let session = MqttSession::new("TRK-TEST");
        session.configure(Endpoint::new("127.0.0.1", 1)).await;
        session.connect().await.unwrap();
        // Second connect on an existing session is a no-op
        session.connect().await.unwrap();
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let session = MqttSession::new("TRK-TEST");
        session.disconnect().await;
        assert!(!session.is_connected());
    }

    #[test]
    fn test_in_flight_cap_fails_fast() {
        let shared = SessionShared {
            connected: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            transitions: StdMutex::new(Vec::new()),
        };

        for _ in 0..MAX_IN_FLIGHT {
            shared.try_acquire_slot().unwrap();
        }
        assert!(matches!(
            shared.try_acquire_slot(),
            Err(PublishError::MaxInFlight(n)) if n == MAX_IN_FLIGHT
        ));

        shared.release_slot();
        shared.try_acquire_slot().unwrap();
    }

    #[test]
    fn test_transition_fires_only_on_flips() {
        let shared = SessionShared {
            connected: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            transitions: StdMutex::new(Vec::new()),
        };
        let flips = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&flips);
        shared
            .transitions
            .lock()
            .unwrap()
            .push(Box::new(move |_| {
                observed.fetch_add(1, Ordering::SeqCst);
            }));

        shared.set_connected(true);
        shared.set_connected(true); // no flip
        shared.set_connected(false);
        assert_eq!(flips.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ack_table_fifo_pairing() {
        let mut acks = AckTable::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();

        acks.register(tx1);
        acks.register(tx2);
        acks.assign(11);
        acks.assign(12);

        // Acks may come back out of order
        acks.complete(12).unwrap().send(Ok(())).unwrap();
        acks.complete(11).unwrap().send(Ok(())).unwrap();

        assert!(rx1.try_recv().unwrap().is_ok());
        assert!(rx2.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_ack_table_revoke_discards_newest_unpaired() {
        let mut acks = AckTable::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        acks.register(tx1);
        acks.register(tx2);
        acks.revoke();
        acks.assign(7);

        // Only the first waiter remains and it got pkid 7
        assert!(acks.complete(7).is_some());
        assert!(acks.pending.is_empty());
        assert!(acks.unpaired.is_empty());
    }

    #[test]
    fn test_ack_table_fail_all_counts_everything() {
        let mut acks = AckTable::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        acks.register(tx1);
        acks.register(tx2);
        acks.assign(3);

        let failed = acks.fail_all(&PublishError::NotConnected);
        assert_eq!(failed, 2);
        assert!(matches!(
            rx1.try_recv().unwrap(),
            Err(PublishError::NotConnected)
        ));
    }
}
