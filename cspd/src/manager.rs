//! Connection manager: attach/detach lifecycle, receive loop, dispatch.
//!
//! Each accepted socket runs [`ConnectionManager::attach_sidecar`] or
//! [`ConnectionManager::attach_ide`] as its own task:
//!
//! 1. the deployment verifier is consulted;
//! 2. an IDE is refused unless some worker owns the sidecar side;
//! 3. ownership is claimed in the store, then the socket is registered
//!    locally;
//! 4. frames are decoded and dispatched in arrival order until the socket
//!    goes away;
//! 5. registry and store entries are released exactly once, however the
//!    loop ended.
//!
//! A peer owned by another worker is detected but never bridged: push
//! requests fail back to the IDE and push responses are dropped.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use csp_common::protocol::{message_type_name, struct_to_json};
use csp_common::{
    ConnectionKey, ConnectionRole, Envelope, MessageFactory, ProtocolError, PushMessage,
    PushRecord, PushResponseStatus, PushStatus, VerificationRequest, WorkerId,
};
use futures_util::FutureExt;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::collaborators::{Collaborators, VerificationJob};
use crate::error::AttachError;
use crate::registry::{ConnectionRegistry, RegisteredSocket};
use crate::store::{ConnectionStore, Deregistration, StoreError};
use crate::transport::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION, Connection, ConnectionId,
    FrameSink, FrameSource, TransportError, close_quietly,
};

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error during WebSocket handling.";
const VERIFICATION_ENQUEUE_ERROR: &str = "Internal server error during verification enqueue";

/// How a receive loop ended.
#[derive(Debug)]
enum LoopExit {
    /// The peer closed the socket.
    Disconnected,
    /// The stream can no longer be trusted.
    Malformed(String),
    /// Anything else, including panics.
    Internal(String),
}

/// Owns the local registry and coordinates it with the shared store.
pub struct ConnectionManager {
    worker_id: WorkerId,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn ConnectionStore>,
    collaborators: Collaborators,
}

impl ConnectionManager {
    pub fn new(
        worker_id: WorkerId,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn ConnectionStore>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            worker_id,
            registry,
            store,
            collaborators,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn ConnectionStore {
        self.store.as_ref()
    }

    /// Whether any worker currently owns the sidecar side of `key`.
    ///
    /// Read-only; a store failure reports "not ready".
    pub async fn is_sidecar_ready(&self, key: &ConnectionKey) -> bool {
        match self.store.get_owner(ConnectionRole::Sidecar, key).await {
            Ok(owner) => owner.is_some(),
            Err(e) => {
                warn!("Readiness check for {} failed: {}", key, e);
                false
            }
        }
    }

    /// Serve a sidecar socket until it closes.
    pub async fn attach_sidecar(&self, key: ConnectionKey, connection: Connection) {
        self.attach(ConnectionRole::Sidecar, key, connection).await;
    }

    /// Serve an IDE socket until it closes.
    pub async fn attach_ide(&self, key: ConnectionKey, connection: Connection) {
        self.attach(ConnectionRole::Ide, key, connection).await;
    }

    async fn attach(&self, role: ConnectionRole, key: ConnectionKey, connection: Connection) {
        let span = info_span!(
            "connection",
            role = role.as_str(),
            app_id = key.app_id(),
            deployment_id = key.deployment_id(),
            worker_id = %self.worker_id,
            connection_id = connection.id.get(),
            org_id = tracing::field::Empty,
            user_id = tracing::field::Empty,
        );
        if let Some(org_id) = key.known_org_id() {
            span.record("org_id", org_id);
        }
        if let Some(user_id) = key.known_user_id() {
            span.record("user_id", user_id);
        }

        self.serve(role, key, connection).instrument(span).await;
    }

    async fn serve(&self, role: ConnectionRole, key: ConnectionKey, connection: Connection) {
        let Connection {
            id,
            sink,
            mut source,
        } = connection;

        let guard = match self.admit(role, &key, id, &sink).await {
            Ok(guard) => guard,
            Err(err) => {
                warn!("{} connection refused: {}", role, err);
                close_quietly(sink.as_ref(), err.close_code(), &err.close_reason()).await;
                return;
            }
        };
        info!("{} connected for {}", role, key);

        let exit = AssertUnwindSafe(self.receive_loop(role, &key, sink.as_ref(), source.as_mut()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| LoopExit::Internal(panic_message(panic.as_ref())));

        match exit {
            LoopExit::Disconnected => info!("{} disconnected from {}", role, key),
            LoopExit::Malformed(detail) => {
                error!("Invalid message from {}: {}", role, detail);
                self.reply(
                    sink.as_ref(),
                    MessageFactory::push_failed(format!("Invalid message format: {detail}")),
                )
                .await;
                close_quietly(sink.as_ref(), CLOSE_POLICY_VIOLATION, "Invalid message format").await;
            }
            LoopExit::Internal(detail) => {
                error!("Unexpected error in {} connection for {}: {}", role, key, detail);
                self.reply(sink.as_ref(), MessageFactory::push_failed(INTERNAL_ERROR_MESSAGE))
                    .await;
                close_quietly(sink.as_ref(), CLOSE_INTERNAL_ERROR, "Internal server error").await;
            }
        }

        guard.release().await;
    }

    /// Verify, check the peer, then claim the store and registry slots.
    async fn admit(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        id: ConnectionId,
        sink: &Arc<dyn FrameSink>,
    ) -> Result<RegistrationGuard, AttachError> {
        let verdict = self
            .collaborators
            .verifier
            .verify(key.app_id(), key.deployment_id())
            .await;
        if !verdict.is_valid {
            return Err(AttachError::DeploymentInvalid {
                message: verdict.error_message,
            });
        }
        if !verdict.log_fields.is_empty() {
            debug!(fields = ?verdict.log_fields, "Deployment verified");
        }

        if role == ConnectionRole::Ide
            && self
                .store
                .get_owner(role.peer(), key)
                .await?
                .is_none()
        {
            return Err(AttachError::PeerNotReady);
        }

        self.store.register(role, key, &self.worker_id).await?;
        let mut guard = RegistrationGuard {
            role,
            key: key.clone(),
            id,
            worker_id: self.worker_id.clone(),
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            registered_locally: false,
            released: false,
        };

        let socket = RegisteredSocket {
            id,
            sink: Arc::clone(sink),
        };
        if let Err(e) = self.registry.register(role, key.clone(), socket) {
            error!("Store accepted {} for {} but the local registry did not: {}", role, key, e);
            guard.release().await;
            return Err(e.into());
        }
        guard.registered_locally = true;
        Ok(guard)
    }

    async fn receive_loop(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        sink: &dyn FrameSink,
        source: &mut dyn FrameSource,
    ) -> LoopExit {
        loop {
            let frame = match source.recv_frame().await {
                Ok(frame) => frame,
                Err(TransportError::Disconnected { code, reason }) => {
                    debug!(?code, ?reason, "Socket closed by peer");
                    return LoopExit::Disconnected;
                }
                Err(TransportError::UnexpectedText) => {
                    return LoopExit::Malformed("text frames are not supported".to_string());
                }
                Err(e) => return LoopExit::Internal(e.to_string()),
            };

            let envelope = match Envelope::decode(&frame) {
                Ok(envelope) => envelope,
                Err(ProtocolError::UnknownMessageType(raw)) => {
                    self.reject_unsupported(sink, &message_type_name(raw)).await;
                    continue;
                }
                Err(e) => return LoopExit::Malformed(e.to_string()),
            };

            if let Err(e) = self.dispatch(role, key, sink, envelope, &frame).await {
                return LoopExit::Internal(e.to_string());
            }
        }
    }

    /// Route one envelope by the sender's role and the message type.
    async fn dispatch(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        sink: &dyn FrameSink,
        envelope: Envelope,
        frame: &[u8],
    ) -> Result<(), StoreError> {
        debug!(
            message_type = envelope.message_type().as_str_name(),
            bytes = frame.len(),
            "Frame received"
        );
        match (role, envelope) {
            (ConnectionRole::Ide, Envelope::PushRequest(push)) => {
                self.handle_push_request(key, sink, push).await
            }
            (ConnectionRole::Ide, Envelope::VerificationRequest(request)) => {
                self.handle_verification_request(key, sink, request).await;
                Ok(())
            }
            (ConnectionRole::Sidecar, Envelope::PushResponse(response)) => {
                if response.status() != PushResponseStatus::Completed {
                    error!(
                        push_id = %response.push_id,
                        status = response.status().as_str_name(),
                        "Sidecar reported push failure: {}",
                        response.error_message
                    );
                }
                self.handle_push_response(key, frame).await
            }
            (_, other) => {
                self.reject_unsupported(sink, other.message_type().as_str_name())
                    .await;
                Ok(())
            }
        }
    }

    async fn handle_push_request(
        &self,
        key: &ConnectionKey,
        ide: &dyn FrameSink,
        push: PushMessage,
    ) -> Result<(), StoreError> {
        let push_id = push.push_id.clone();
        info!(push_id = %push_id, "Push request received");

        let record = PushRecord {
            id: push_id.clone(),
            deployment_id: key.deployment_id().to_string(),
            status: PushStatus::Pushing,
            code_diff: push.code_diff.clone(),
            change_description: push.change_description.clone(),
        };
        if let Err(e) = self.collaborators.pushes.create(record).await {
            warn!(push_id = %push_id, "Failed to record push: {}", e);
        }

        let owner = match self.store.get_owner(ConnectionRole::Sidecar, key).await {
            Ok(owner) => owner,
            Err(e) => {
                error!(push_id = %push_id, "Sidecar owner lookup failed: {}", e);
                self.mark_push(&push_id, PushStatus::Failed).await;
                return Err(e);
            }
        };
        match owner {
            Some(owner) if owner == self.worker_id => {}
            owner => {
                let owner = owner.map_or_else(|| "none".to_string(), |o| o.to_string());
                warn!(
                    push_id = %push_id,
                    "Sidecar for {} is on worker {}; cross-worker forwarding is not supported",
                    key, owner
                );
                self.reply(
                    ide,
                    MessageFactory::push_failed_for(
                        &push_id,
                        format!(
                            "Sidecar on different worker ({owner}). Cross-worker messaging required."
                        ),
                    ),
                )
                .await;
                self.mark_push(&push_id, PushStatus::Failed).await;
                return Ok(());
            }
        }

        let Some(sidecar) = self.registry.lookup(ConnectionRole::Sidecar, key) else {
            error!(
                push_id = %push_id,
                "Store lists this worker as sidecar owner for {} but no socket is registered",
                key
            );
            self.reply(
                ide,
                MessageFactory::push_failed_for(
                    &push_id,
                    "Sidecar connection lost or internal state error.",
                ),
            )
            .await;
            self.mark_push(&push_id, PushStatus::Failed).await;
            return Ok(());
        };

        match sidecar
            .send_frame(Envelope::PushRequest(push).encode_to_vec())
            .await
        {
            Ok(()) => {
                info!(push_id = %push_id, "Push forwarded to sidecar");
                self.mark_push(&push_id, PushStatus::Pushed).await;
            }
            Err(e) => {
                error!(push_id = %push_id, "Failed to forward push to sidecar: {}", e);
                self.mark_push(&push_id, PushStatus::Failed).await;
                self.reply(
                    ide,
                    MessageFactory::push_failed_for(&push_id, format!("Failed to reach sidecar: {e}")),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Relay a sidecar's push response to the IDE, byte for byte.
    async fn handle_push_response(&self, key: &ConnectionKey, frame: &[u8]) -> Result<(), StoreError> {
        match self.store.get_owner(ConnectionRole::Ide, key).await? {
            None => {
                warn!("No IDE connected for {}; dropping push response", key);
                return Ok(());
            }
            Some(owner) if owner != self.worker_id => {
                warn!(
                    "IDE for {} is on worker {}; dropping push response (cross-worker forwarding is not supported)",
                    key, owner
                );
                return Ok(());
            }
            Some(_) => {}
        }

        let Some(ide) = self.registry.lookup(ConnectionRole::Ide, key) else {
            error!(
                "Store lists this worker as IDE owner for {} but no socket is registered; dropping push response",
                key
            );
            return Ok(());
        };

        match ide.send_frame(frame.to_vec()).await {
            Ok(()) => debug!("Push response forwarded to IDE"),
            Err(e) => warn!("Failed to forward push response to IDE: {}", e),
        }
        Ok(())
    }

    async fn handle_verification_request(
        &self,
        key: &ConnectionKey,
        ide: &dyn FrameSink,
        request: VerificationRequest,
    ) {
        let job = VerificationJob {
            user_id: key.known_user_id().map(str::to_string),
            app_id: key.app_id().to_string(),
            deployment_id: key.deployment_id().to_string(),
            push_id: request.push_id.clone(),
            tests: request.tests.as_ref().map(struct_to_json).unwrap_or_default(),
        };

        let response = match self.collaborators.runner.run(job).await {
            Ok(()) => {
                info!(push_id = %request.push_id, "Verification enqueued");
                MessageFactory::verification_in_progress()
            }
            Err(e) => {
                error!(push_id = %request.push_id, "Failed to enqueue verification: {:#}", e);
                MessageFactory::verification_failed(VERIFICATION_ENQUEUE_ERROR)
            }
        };
        self.reply(ide, response).await;
    }

    async fn reject_unsupported(&self, sink: &dyn FrameSink, type_name: &str) {
        warn!("Unsupported message type: {}", type_name);
        self.reply(
            sink,
            MessageFactory::push_failed(format!("Invalid or unsupported message type: {type_name}")),
        )
        .await;
    }

    async fn mark_push(&self, push_id: &str, status: PushStatus) {
        if let Err(e) = self.collaborators.pushes.update(push_id, status).await {
            warn!(push_id = %push_id, "Failed to update push status to {}: {}", status, e);
        }
    }

    /// Best-effort send back to the socket that triggered the handler.
    async fn reply(&self, sink: &dyn FrameSink, envelope: Envelope) {
        if let Err(e) = sink.send_frame(envelope.encode_to_vec()).await {
            debug!("Failed to send {} to client: {}", envelope.message_type().as_str_name(), e);
        }
    }

    /// Close every local socket with "going away" and wait for their
    /// receive loops to clean up.
    pub async fn shutdown(&self, grace: Duration) {
        let sockets = self.registry.sockets();
        if sockets.is_empty() {
            return;
        }
        info!("Closing {} active connections", sockets.len());
        for (role, key, socket) in sockets {
            debug!("Closing {} connection {} for {}", role, socket.id, key);
            close_quietly(socket.sink.as_ref(), CLOSE_GOING_AWAY, "Server shutting down").await;
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if !self.registry.is_empty() {
            warn!(
                "{} connections still registered after shutdown grace period",
                self.registry.len()
            );
        }
    }
}

/// Holds one (role, key) claim in the registry and store.
///
/// [`RegistrationGuard::release`] is the normal path. If the owning task is
/// dropped first, `Drop` removes the registry entry and schedules the store
/// release on the current runtime.
struct RegistrationGuard {
    role: ConnectionRole,
    key: ConnectionKey,
    id: ConnectionId,
    worker_id: WorkerId,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn ConnectionStore>,
    registered_locally: bool,
    released: bool,
}

impl RegistrationGuard {
    async fn release(mut self) {
        if self.registered_locally {
            self.registry.deregister_owned(self.role, &self.key, self.id);
        }
        match self
            .store
            .deregister(self.role, &self.key, &self.worker_id)
            .await
        {
            Ok(Deregistration::HeldBy(owner)) => debug!(
                "{} ownership of {} already passed to worker {}",
                self.role, self.key, owner
            ),
            Ok(_) => {}
            Err(e) => error!("Failed to release {} ownership of {}: {}", self.role, self.key, e),
        }
        self.released = true;
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.registered_locally {
            self.registry.deregister_owned(self.role, &self.key, self.id);
        }

        let (role, key, worker_id) = (self.role, self.key.clone(), self.worker_id.clone());
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.deregister(role, &key, &worker_id).await {
                        warn!("Deferred release of {} ownership of {} failed: {}", role, key, e);
                    }
                });
            }
            Err(_) => warn!(
                "No runtime to release {} ownership of {}; the entry will expire",
                role, key
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic with non-string payload".to_string()
    }
}
