// SPDX-License-Identifier: GPL-3.0-only

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which signals cancel the running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// SIGINT, SIGTERM and SIGHUP
    All,
    /// SIGTERM and SIGHUP only; Ctrl-C belongs to the interactive child
    IgnoreInterrupt,
}

/// Spawn a listener that cancels the returned token on the first matching signal.
pub fn install(mode: Cancellation) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    let streams = signal(SignalKind::terminate())
        .and_then(|term| signal(SignalKind::hangup()).map(|hup| (term, hup)));
    let interrupt = match mode {
        Cancellation::All => signal(SignalKind::interrupt()).ok(),
        // Registering a handler keeps SIGINT from killing us while the child runs.
        Cancellation::IgnoreInterrupt => {
            if let Ok(mut ignored) = signal(SignalKind::interrupt()) {
                tokio::spawn(async move { while ignored.recv().await.is_some() {} });
            }
            None
        }
    };

    let (mut term, mut hup) = match streams {
        Ok(streams) => streams,
        Err(e) => {
            warn!(error = %e, "failed to install signal handlers");
            return token;
        }
    };

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
            _ = recv_optional(interrupt) => "SIGINT",
        };
        info!(signal = name, "cancelling");
        trigger.cancel();
    });

    token
}

async fn recv_optional(stream: Option<tokio::signal::unix::Signal>) {
    match stream {
        Some(mut stream) => {
            stream.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}
