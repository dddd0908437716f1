//! Automates de conduite : contrôleur SOC, récupération de défaut de communication
//! et gestionnaire de mode qui les possède.

pub mod fault_recovery;
pub mod operation;
pub mod soc;

use crate::devices::{DeviceCommand, DeviceError, DeviceLink};
use crate::shutdown::wait_or_cancel;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Interruption d'une séquence de commandes.
///
/// `Aborted` vient d'une annulation (stop, changement de mode, arrêt) et n'est pas une panne.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SequenceError {
    #[error("sequence aborted")]
    Aborted,
    #[error("{device}: {command} failed: {source}")]
    Command {
        device: String,
        command: String,
        #[source]
        source: DeviceError,
    },
}

/// Envoie une commande; l'annulation de `run` abandonne aussi une écriture en attente
pub(crate) async fn issue(
    link: &DeviceLink,
    command: DeviceCommand,
    run: &CancellationToken,
) -> Result<(), SequenceError> {
    if run.is_cancelled() {
        return Err(SequenceError::Aborted);
    }
    let outcome = tokio::select! {
        biased;
        _ = run.cancelled() => {
            info!(device = link.id(), %command, "pending command abandoned");
            return Err(SequenceError::Aborted);
        }
        outcome = link.command(&command) => outcome,
    };
    match outcome {
        Ok(ack) => {
            info!(device = link.id(), %command, ack = %ack.message, "command acknowledged");
            Ok(())
        }
        Err(source) => Err(SequenceError::Command {
            device: link.id().to_string(),
            command: command.to_string(),
            source,
        }),
    }
}

pub(crate) async fn pause(run: &CancellationToken, duration: Duration) -> Result<(), SequenceError> {
    wait_or_cancel(run, duration).await.map_err(|_| SequenceError::Aborted)
}
