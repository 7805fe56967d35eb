//! In-memory sockets and collaborator doubles for manager tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use csp_common::{ConnectionKey, ConnectionRole, Envelope, WorkerId};
use tokio::sync::mpsc;

use crate::collaborators::{
    Collaborators, DeploymentVerdict, DeploymentVerifier, VerificationJob, VerificationRunner,
};
use crate::manager::ConnectionManager;
use crate::registry::ConnectionRegistry;
use crate::standalone::{AlwaysValidVerifier, InMemoryPushRepository, QueuedVerificationRunner};
use crate::store::{ConnectionStore, Deregistration, LocalConnectionStore, StoreError};
use crate::transport::{Connection, FrameSink, FrameSource, TransportError};

const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

enum Inbound {
    Frame(Vec<u8>),
    Text,
    Disconnect,
    Panic,
}

#[derive(Default)]
struct SinkState {
    sent: Vec<Vec<u8>>,
    close: Option<(u16, String)>,
}

struct MockSink {
    state: Mutex<SinkState>,
    closed: Arc<AtomicBool>,
    fail_sends: AtomicBool,
    inbound: mpsc::UnboundedSender<Inbound>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Io("broken pipe".into()));
        }
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .push(frame);
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close = Some((code, reason.to_string()));
        // The remote end acknowledges the close and the read side ends.
        let _ = self.inbound.send(Inbound::Disconnect);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockSource {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        match self.inbound.recv().await {
            Some(Inbound::Frame(frame)) => Ok(frame),
            Some(Inbound::Text) => Err(TransportError::UnexpectedText),
            Some(Inbound::Panic) => panic!("socket read exploded"),
            Some(Inbound::Disconnect) | None => {
                self.closed.store(true, Ordering::SeqCst);
                Err(TransportError::Disconnected {
                    code: Some(1000),
                    reason: None,
                })
            }
        }
    }
}

/// Factory for in-memory socket pairs.
pub struct MockSocket;

impl MockSocket {
    /// A server-side [`Connection`] and the client end driving it.
    pub fn pair() -> (Connection, MockPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(MockSink {
            state: Mutex::new(SinkState::default()),
            closed: Arc::clone(&closed),
            fail_sends: AtomicBool::new(false),
            inbound: tx.clone(),
        });
        let source = MockSource {
            inbound: rx,
            closed,
        };
        let connection = Connection::new(Arc::clone(&sink) as Arc<dyn FrameSink>, Box::new(source));
        (connection, MockPeer { tx, sink })
    }
}

/// Client end of a mock socket.
pub struct MockPeer {
    tx: mpsc::UnboundedSender<Inbound>,
    sink: Arc<MockSink>,
}

impl MockPeer {
    pub fn send(&self, envelope: &Envelope) {
        self.send_raw(envelope.encode_to_vec());
    }

    pub fn send_raw(&self, frame: Vec<u8>) {
        let _ = self.tx.send(Inbound::Frame(frame));
    }

    pub fn send_text(&self) {
        let _ = self.tx.send(Inbound::Text);
    }

    pub fn disconnect(&self) {
        let _ = self.tx.send(Inbound::Disconnect);
    }

    /// Make the server's next read panic.
    pub fn explode(&self) {
        let _ = self.tx.send(Inbound::Panic);
    }

    /// Make every server-side send fail.
    pub fn fail_sends(&self) {
        self.sink.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn received_frames(&self) -> Vec<Vec<u8>> {
        self.sink
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .clone()
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.received_frames()
            .iter()
            .map(|frame| Envelope::decode(frame).expect("server sent an undecodable frame"))
            .collect()
    }

    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.sink
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    /// Wait until at least `count` envelopes were received.
    pub async fn wait_for_envelopes(&self, count: usize) -> Vec<Envelope> {
        wait_until(|| self.received_frames().len() >= count).await;
        self.received()
    }

    /// Wait for the server to close this socket.
    pub async fn wait_for_close(&self) -> (u16, String) {
        wait_until(|| self.close_frame().is_some()).await;
        self.close_frame().expect("close frame recorded")
    }
}

/// Poll `condition` until it holds, panicking after a timeout.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            WAIT_TIMEOUT
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Verifier that refuses every deployment.
pub struct RejectingVerifier(pub String);

#[async_trait]
impl DeploymentVerifier for RejectingVerifier {
    async fn verify(&self, _app_id: &str, _deployment_id: &str) -> DeploymentVerdict {
        DeploymentVerdict::invalid(self.0.clone())
    }
}

/// Runner whose queue is always unavailable.
pub struct FailingRunner;

#[async_trait]
impl VerificationRunner for FailingRunner {
    async fn run(&self, _job: VerificationJob) -> anyhow::Result<()> {
        anyhow::bail!("task queue unavailable")
    }
}

/// A local store whose owner lookups can be made to fail.
pub struct FlakyStore {
    inner: Arc<LocalConnectionStore>,
    fail_lookups: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<LocalConnectionStore>) -> Self {
        Self {
            inner,
            fail_lookups: AtomicBool::new(false),
        }
    }

    pub fn fail_lookups(&self) {
        self.fail_lookups.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionStore for FlakyStore {
    async fn register(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        worker_id: &WorkerId,
    ) -> Result<(), StoreError> {
        self.inner.register(role, key, worker_id).await
    }

    async fn deregister(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        worker_id: &WorkerId,
    ) -> Result<Deregistration, StoreError> {
        self.inner.deregister(role, key, worker_id).await
    }

    async fn get_owner(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
    ) -> Result<Option<WorkerId>, StoreError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        self.inner.get_owner(role, key).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// A manager wired to inspectable standalone collaborators.
pub struct Harness {
    pub manager: Arc<ConnectionManager>,
    pub store: Arc<LocalConnectionStore>,
    pub pushes: Arc<InMemoryPushRepository>,
    pub runner: Arc<QueuedVerificationRunner>,
}

impl Harness {
    pub fn new(worker_id: &str) -> Self {
        Self::sharing(worker_id, Arc::new(LocalConnectionStore::new()))
    }

    /// A worker sharing `store` with other harnesses.
    pub fn sharing(worker_id: &str, store: Arc<LocalConnectionStore>) -> Self {
        Self::configured(worker_id, store, |_| {})
    }

    /// A worker whose owner lookups go through a [`FlakyStore`].
    pub fn flaky(worker_id: &str) -> (Self, Arc<FlakyStore>) {
        let local = Arc::new(LocalConnectionStore::new());
        let flaky = Arc::new(FlakyStore::new(Arc::clone(&local)));
        let harness = Self::build(worker_id, local, Arc::clone(&flaky) as _, |_| {});
        (harness, flaky)
    }

    /// Build with the standalone collaborators, letting `customize` swap some out.
    pub fn configured(
        worker_id: &str,
        store: Arc<LocalConnectionStore>,
        customize: impl FnOnce(&mut Collaborators),
    ) -> Self {
        Self::build(worker_id, Arc::clone(&store), store as _, customize)
    }

    fn build(
        worker_id: &str,
        store: Arc<LocalConnectionStore>,
        backing: Arc<dyn ConnectionStore>,
        customize: impl FnOnce(&mut Collaborators),
    ) -> Self {
        let pushes = Arc::new(InMemoryPushRepository::new());
        let runner = Arc::new(QueuedVerificationRunner::new());
        let mut collaborators = Collaborators {
            verifier: Arc::new(AlwaysValidVerifier),
            pushes: Arc::clone(&pushes) as _,
            runner: Arc::clone(&runner) as _,
        };
        customize(&mut collaborators);

        let manager = Arc::new(ConnectionManager::new(
            WorkerId::new(worker_id),
            Arc::new(ConnectionRegistry::new()),
            backing,
            collaborators,
        ));
        Self {
            manager,
            store,
            pushes,
            runner,
        }
    }
}
