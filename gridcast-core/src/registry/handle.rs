//! Handle for communicating with the session registry actor.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use super::RegistryError;
use super::commands::{RegistryCommand, Registration, SessionInfo};
use crate::session::SessionMode;

/// How often shutdown-all re-checks for sessions that have not deregistered yet.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of [`RegistryHandle::shutdown_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub signalled: usize,
    /// Sessions still registered when the grace period ran out
    pub remaining: usize,
}

/// Cloneable handle to the registry actor.
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Registers a session. The returned receiver fires when the registry
    /// asks the session to close.
    ///
    /// # Errors
    /// - `RegistryError::DuplicateSession` - The id is already registered
    /// - `RegistryError::ActorShutdown` - The registry is no longer running
    pub async fn register(
        &self,
        registration: Registration,
    ) -> Result<oneshot::Receiver<()>, RegistryError> {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (responder, rx) = oneshot::channel();
        let cmd = RegistryCommand::Register {
            registration,
            shutdown,
            responder,
        };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| RegistryError::ActorShutdown)?;

        rx.await.map_err(|_| RegistryError::ActorShutdown)??;
        Ok(shutdown_rx)
    }

    /// Records the encoder currently serving a session.
    ///
    /// # Errors
    /// - `RegistryError::ActorShutdown` - The registry is no longer running
    pub async fn update_encoder(
        &self,
        session_id: Uuid,
        pid: Option<u32>,
        mode: SessionMode,
    ) -> Result<(), RegistryError> {
        let cmd = RegistryCommand::UpdateEncoder {
            session_id,
            pid,
            mode,
        };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| RegistryError::ActorShutdown)
    }

    /// Removes a session. Returns whether it was registered.
    ///
    /// # Errors
    /// - `RegistryError::ActorShutdown` - The registry is no longer running
    pub async fn deregister(&self, session_id: Uuid) -> Result<bool, RegistryError> {
        let (responder, rx) = oneshot::channel();
        let cmd = RegistryCommand::Deregister {
            session_id,
            responder,
        };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| RegistryError::ActorShutdown)?;

        rx.await.map_err(|_| RegistryError::ActorShutdown)
    }

    /// Lists live sessions, oldest first.
    ///
    /// # Errors
    /// - `RegistryError::ActorShutdown` - The registry is no longer running
    pub async fn list(&self) -> Result<Vec<SessionInfo>, RegistryError> {
        let (responder, rx) = oneshot::channel();
        let cmd = RegistryCommand::List { responder };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| RegistryError::ActorShutdown)?;

        rx.await.map_err(|_| RegistryError::ActorShutdown)
    }

    /// Asks every session to close and waits up to `grace` for all of them
    /// to deregister.
    ///
    /// # Errors
    /// - `RegistryError::ActorShutdown` - The registry is no longer running
    pub async fn shutdown_all(&self, grace: Duration) -> Result<ShutdownReport, RegistryError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::ShutdownAll { responder })
            .await
            .map_err(|_| RegistryError::ActorShutdown)?;
        let signalled = rx.await.map_err(|_| RegistryError::ActorShutdown)?;

        let deadline = Instant::now() + grace;
        loop {
            let remaining = self.list().await?.len();
            if remaining == 0 || Instant::now() >= deadline {
                if remaining > 0 {
                    tracing::warn!(remaining, "Sessions still open after shutdown grace period");
                }
                return Ok(ShutdownReport {
                    signalled,
                    remaining,
                });
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }
}
