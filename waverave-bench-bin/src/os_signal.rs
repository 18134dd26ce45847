use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Get a token that's cancelled once the OS asks the program to quit.
///
/// Must be called from within the tokio runtime.
pub fn quit_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let kinds = [
            ("SIGINT", SignalKind::interrupt()),
            ("SIGHUP", SignalKind::hangup()),
            ("SIGTERM", SignalKind::terminate()),
            ("SIGPIPE", SignalKind::pipe()),
            ("SIGQUIT", SignalKind::quit()),
        ];
        for (name, kind) in kinds {
            let mut sig = match signal(kind) {
                Ok(sig) => sig,
                Err(e) => {
                    warn!("Couldn't listen for {}: {}", name, e);
                    continue;
                }
            };
            let cancel_tx = cancel.clone();
            tokio::spawn(async move {
                if sig.recv().await.is_some() {
                    debug!("Got {}, stopping", name);
                    cancel_tx.cancel();
                }
            });
        }
    }
    #[cfg(windows)]
    {
        use tokio::signal::windows;

        match windows::ctrl_c() {
            Ok(mut sig) => {
                let cancel_tx = cancel.clone();
                tokio::spawn(async move {
                    if sig.recv().await.is_some() {
                        debug!("Got ctrl-c, stopping");
                        cancel_tx.cancel();
                    }
                });
            }
            Err(e) => warn!("Couldn't listen for ctrl-c: {}", e),
        }
        match windows::ctrl_break() {
            Ok(mut sig) => {
                let cancel_tx = cancel.clone();
                tokio::spawn(async move {
                    if sig.recv().await.is_some() {
                        debug!("Got ctrl-break, stopping");
                        cancel_tx.cancel();
                    }
                });
            }
            Err(e) => warn!("Couldn't listen for ctrl-break: {}", e),
        }
    }
    cancel
}
