//! Attentes coopératives annulables.
//!
//! L'annulation d'un `CancellationToken` signifie uniquement « arrêt demandé ».
//! Elle remonte sous la forme de [`Cancelled`], distincte de toute erreur métier :
//! une boucle qui reçoit `Cancelled` sort proprement, une boucle qui reçoit une
//! autre erreur la journalise et continue.
//!
//! Le token racine est annulé par Ctrl-C, par SIGTERM (arrêt du superviseur) ou par le
//! moniteur process.

use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled by shutdown")]
pub struct Cancelled;

/// Dort `duration`, ou retourne `Err(Cancelled)` dès que le token est annulé.
pub async fn wait_or_cancel(token: &CancellationToken, duration: Duration) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

pub async fn wait_until_or_cancel(token: &CancellationToken, deadline: Instant) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep_until(deadline) => Ok(()),
    }
}

/// Annule `root` au premier Ctrl-C ou SIGTERM. SIGTERM est enregistré avant le retour,
/// un signal arrivé juste après le démarrage n'est donc pas perdu.
pub fn spawn_signal_listener(root: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        #[cfg(unix)]
        let term = async {
            terminate.recv().await;
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<()>();

        tokio::select! {
            _ = root.cancelled() => return,
            _ = interrupt => info!("interrupt received, shutting down"),
            _ = term => info!("SIGTERM received, shutting down"),
        }
        root.cancel();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_completes_without_cancel() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert_eq!(wait_or_cancel(&token, Duration::from_secs(3)).await, Ok(()));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let token = CancellationToken::new();
        let child = token.child_token();
        let waiter = tokio::spawn(async move { wait_or_cancel(&child, Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_token_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(wait_until_or_cancel(&token, deadline).await, Err(Cancelled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_cancels_root() {
        let root = CancellationToken::new();
        let listener = spawn_signal_listener(root.clone()).unwrap();

        let sent = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(sent.success());
        tokio::time::timeout(Duration::from_secs(5), root.cancelled()).await.unwrap();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_ends_with_root() {
        let root = CancellationToken::new();
        let listener = spawn_signal_listener(root.clone()).unwrap();
        root.cancel();
        tokio::time::timeout(Duration::from_secs(5), listener).await.unwrap().unwrap();
    }
}
