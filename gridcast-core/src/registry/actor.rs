//! Actor owning the process-wide session map.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::RegistryError;
use super::commands::{RegistryCommand, SessionInfo};
use super::handle::RegistryHandle;

struct Entry {
    info: SessionInfo,
    /// Taken when shutdown-all fires so each session is signalled once
    shutdown: Option<oneshot::Sender<()>>,
}

/// Spawns the registry actor and returns its handle.
///
/// All mutation of the session map happens inside the actor task, so
/// registering and removing the same entry can never interleave.
pub fn spawn_registry() -> RegistryHandle {
    let (sender, receiver) = mpsc::channel(100);

    tokio::spawn(async move {
        run_actor_loop(receiver).await;
    });

    RegistryHandle::new(sender)
}

async fn run_actor_loop(mut receiver: mpsc::Receiver<RegistryCommand>) {
    tracing::debug!("Session registry actor started");

    let mut sessions: HashMap<Uuid, Entry> = HashMap::new();
    while let Some(command) = receiver.recv().await {
        handle_command(&mut sessions, command);
    }

    tracing::debug!(
        remaining = sessions.len(),
        "Session registry actor stopped"
    );
}

fn handle_command(sessions: &mut HashMap<Uuid, Entry>, command: RegistryCommand) {
    match command {
        RegistryCommand::Register {
            registration,
            shutdown,
            responder,
        } => {
            let id = registration.session_id;
            let result = if sessions.contains_key(&id) {
                Err(RegistryError::DuplicateSession { session_id: id })
            } else {
                let info = SessionInfo {
                    id,
                    sources: registration.sources,
                    format: registration.format,
                    mode: Default::default(),
                    encoder_pid: None,
                    created_at: Utc::now(),
                };
                sessions.insert(
                    id,
                    Entry {
                        info,
                        shutdown: Some(shutdown),
                    },
                );
                tracing::debug!(session_id = %id, live = sessions.len(), "Session registered");
                Ok(())
            };
            let _ = responder.send(result);
        }

        RegistryCommand::UpdateEncoder {
            session_id,
            pid,
            mode,
        } => {
            if let Some(entry) = sessions.get_mut(&session_id) {
                entry.info.encoder_pid = pid;
                entry.info.mode = mode;
            }
        }

        RegistryCommand::Deregister {
            session_id,
            responder,
        } => {
            let removed = sessions.remove(&session_id).is_some();
            if removed {
                tracing::debug!(%session_id, live = sessions.len(), "Session deregistered");
            }
            let _ = responder.send(removed);
        }

        RegistryCommand::List { responder } => {
            let mut list: Vec<SessionInfo> =
                sessions.values().map(|entry| entry.info.clone()).collect();
            list.sort_by_key(|info| info.created_at);
            let _ = responder.send(list);
        }

        RegistryCommand::ShutdownAll { responder } => {
            let signalled = sessions
                .values_mut()
                .filter_map(|entry| entry.shutdown.take())
                .filter(|trigger| !trigger.is_closed())
                .map(|trigger| trigger.send(()).is_ok())
                .filter(|sent| *sent)
                .count();
            tracing::info!(signalled, "Signalled all sessions to shut down");
            let _ = responder.send(signalled);
        }
    }
}
