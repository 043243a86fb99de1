//! Primary/secondary role switching.
//!
//! Exactly one role task runs at a time: the scheduler loop (primary) or the
//! mirroring client (secondary). The supervisor owns the task's handle and
//! cancellation token; switching cancels the running task, waits for it to
//! exit, then starts the other.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::secondary::PrimaryTarget;
use crate::{scheduler, secondary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleCommand {
    /// Remote settings changed; start whichever role they call for.
    Reconcile,
    /// The primary unpaired us; clear the remote target first.
    Unpaired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary { server: String, port: u16 },
}

struct RoleTask {
    role: Role,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RoleTask {
    fn start(engine: &Arc<Engine>, role: Role, shutdown: &CancellationToken) -> Self {
        let cancel = shutdown.child_token();
        info!(?role, "starting role");
        let handle = match &role {
            Role::Primary => tokio::spawn(scheduler::run(engine.clone(), cancel.clone())),
            Role::Secondary { server, port } => {
                let target = PrimaryTarget {
                    server: server.clone(),
                    port: *port,
                    tls: engine.settings.remote_tls,
                };
                tokio::spawn(secondary::run(engine.clone(), target, cancel.clone()))
            }
        };
        Self {
            role,
            cancel,
            handle,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(role = ?self.role, "role task ended abnormally: {e}");
        }
    }
}

async fn desired(engine: &Engine) -> Role {
    let remote = engine.remote().await;
    match remote.server {
        Some(server) => Role::Secondary {
            server,
            port: remote.port,
        },
        None => Role::Primary,
    }
}

/// Run until `shutdown`, applying role commands as they arrive.
pub async fn supervise(
    engine: Arc<Engine>,
    mut commands: mpsc::Receiver<RoleCommand>,
    shutdown: CancellationToken,
) {
    let mut task = RoleTask::start(&engine, desired(&engine).await, &shutdown);

    loop {
        let cmd = tokio::select! {
            _ = shutdown.cancelled() => break,
            cmd = commands.recv() => cmd,
        };
        let Some(cmd) = cmd else { break };

        if cmd == RoleCommand::Unpaired {
            engine.clear_remote().await;
        }
        let role = desired(&engine).await;
        if role == task.role && !task.handle.is_finished() {
            continue;
        }
        info!(from = ?task.role, to = ?role, "switching role");
        task.stop().await;
        task = RoleTask::start(&engine, role, &shutdown);
    }

    task.stop().await;
}
