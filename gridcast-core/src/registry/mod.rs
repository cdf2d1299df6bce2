//! Process-wide registry of live sessions, used for listing and bulk shutdown.

pub mod actor;
pub mod commands;
pub mod handle;

use thiserror::Error;
use uuid::Uuid;

pub use actor::spawn_registry;
pub use commands::{Registration, RegistryCommand, SessionInfo};
pub use handle::{RegistryHandle, ShutdownReport};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session {session_id} is already registered")]
    DuplicateSession { session_id: Uuid },

    #[error("Session registry has shut down")]
    ActorShutdown,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::encoder::SourceId;
    use crate::session::SessionMode;
    use crate::streaming::OutputFormat;

    fn registration(id: Uuid) -> Registration {
        Registration {
            session_id: id,
            sources: vec![SourceId::new("cam1").unwrap()],
            format: OutputFormat::Mp4,
        }
    }

    #[tokio::test]
    async fn test_register_update_list_deregister() {
        let registry = spawn_registry();
        let id = Uuid::new_v4();

        let _shutdown = registry.register(registration(id)).await.unwrap();
        registry
            .update_encoder(id, Some(4242), SessionMode::Degraded)
            .await
            .unwrap();

        let sessions = registry.list().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].encoder_pid, Some(4242));
        assert_eq!(sessions[0].mode, SessionMode::Degraded);

        assert!(registry.deregister(id).await.unwrap());
        assert!(!registry.deregister(id).await.unwrap());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let registry = spawn_registry();
        let id = Uuid::new_v4();

        let _first = registry.register(registration(id)).await.unwrap();
        let second = registry.register(registration(id)).await;

        assert_eq!(
            second.unwrap_err(),
            RegistryError::DuplicateSession { session_id: id }
        );
    }

    #[tokio::test]
    async fn test_shutdown_all_signals_and_waits_for_deregistration() {
        let registry = spawn_registry();
        let id = Uuid::new_v4();
        let shutdown = registry.register(registration(id)).await.unwrap();

        let session_registry = registry.clone();
        tokio::spawn(async move {
            if shutdown.await.is_ok() {
                session_registry.deregister(id).await.unwrap();
            }
        });

        let report = registry.shutdown_all(Duration::from_secs(2)).await.unwrap();

        assert_eq!(
            report,
            ShutdownReport {
                signalled: 1,
                remaining: 0
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_all_reports_stragglers() {
        let registry = spawn_registry();
        let _ignored = registry.register(registration(Uuid::new_v4())).await.unwrap();

        let report = registry
            .shutdown_all(Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(report.signalled, 1);
        assert_eq!(report.remaining, 1);
    }
}
