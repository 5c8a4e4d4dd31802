// ===============================
// src/lifecycle.rs
// ===============================
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Konteks shutdown eksplisit; di-clone ke setiap komponen saat konstruksi.
/// Sekali di-trigger tetap ter-trigger.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn termination_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
            _ = term.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_is_seen_by_every_clone() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        assert!(!other.is_triggered());

        let waiter = tokio::spawn(async move { other.cancelled().await });
        shutdown.trigger();
        shutdown.trigger();

        tokio::time::timeout(Duration::from_millis(100), waiter).await.unwrap().unwrap();
        assert!(shutdown.is_triggered());
    }
}
