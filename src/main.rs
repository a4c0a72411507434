use fleet_control::auth::{NonceLedger, NonceSweeper, SignatureAuthenticator};
use fleet_control::config::ServerConfig;
use fleet_control::deploy::{
    resolve_script, DeployRequest, PendingStartCoordinator, ScriptLauncher, ScriptPackageCache,
    SharedTempRefs, StagedArtifact,
};
use fleet_control::session::{PeerRole, PeerSession, SessionHandle, SessionManager};
use fleet_shared::{msg_type, Message};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Services shared by every connection task
struct Services {
    auth: SignatureAuthenticator,
    sessions: Arc<SessionManager>,
    launcher: ScriptLauncher,
    scripts_dir: PathBuf,
}

/// Body of a controller's `script/deploy`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployCommand {
    deployment_id: String,
    devices: Vec<String>,
    name: String,
    /// Complete `script/run` message to forward verbatim
    #[serde(default)]
    run_message: Option<Value>,
    #[serde(default)]
    staged: Option<StagedCommand>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StagedCommand {
    shared_id: String,
    path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ServerConfig::from_env();
    info!("Fleet control server starting");
    info!("  listen: {}", config.listen_addr);
    info!("  scripts: {}", config.scripts_dir.display());
    if config.secret.is_empty() {
        warn!("FLEET_SECRET is empty, signatures offer no protection");
    }
    if config.auth_debug {
        warn!("Auth debug logging enabled");
    }

    let nonces = Arc::new(NonceLedger::new());
    let sweeper = NonceSweeper::start(nonces.clone());

    let coordinator = Arc::new(PendingStartCoordinator::new(config.start_wait));
    let temp_refs = Arc::new(SharedTempRefs::new(config.temp_grace));
    let cache = Arc::new(ScriptPackageCache::new());
    let sessions = Arc::new(SessionManager::new());
    let launcher = ScriptLauncher::new(coordinator, temp_refs, cache, sessions.clone());
    let watcher = launcher.start_expiry_watcher();

    let services = Arc::new(Services {
        auth: SignatureAuthenticator::new(config.secret.as_bytes(), nonces)
            .with_debug(config.auth_debug),
        sessions,
        launcher,
        scripts_dir: config.scripts_dir.clone(),
    });

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Listening on {}", config.listen_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let services = services.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, services).await;
                    });
                }
                Err(e) => error!("Accept failed: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    sweeper.stop().await;
    watcher.abort();
    Ok(())
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, services: Arc<Services>) {
    debug!("Connection from {}", addr);
    let mut session = PeerSession::new(stream, addr);

    let Some(handle) = accept_hello(&mut session, &services).await else {
        session.close().await;
        return;
    };
    services.sessions.register(handle.clone()).await;
    info!("{:?} {} connected from {}", handle.role, handle.peer_id, addr);

    while let Some(message) = session.recv().await {
        if !services.auth.verify_message(&message).await {
            warn!("Rejected {} from {}: bad signature or replay", message.msg_type, handle.peer_id);
            let _ = handle.send(&Message::error("authentication failed")).await;
            continue;
        }
        route(&services, &handle, message).await;
    }

    services.sessions.unregister(&handle).await;
    info!("{} disconnected", handle.peer_id);
    drop(handle);
    session.close().await;
}

/// The first message must be a signed hello naming the peer
async fn accept_hello(session: &mut PeerSession, services: &Services) -> Option<SessionHandle> {
    let addr = session.addr();
    let message = session.recv().await?;

    let refusal = if message.msg_type != msg_type::HELLO {
        Some("expected app/hello")
    } else if !services.auth.verify_message(&message).await {
        Some("authentication failed")
    } else {
        None
    };
    if let Some(reason) = refusal {
        warn!("Refused {} from {}: {}", message.msg_type, addr, reason);
        let _ = session.send(&Message::error(reason)).await;
        return None;
    }

    let peer_id = message.udid.as_deref().map(str::trim).unwrap_or_default();
    if peer_id.is_empty() {
        warn!("Hello from {} without udid", addr);
        let _ = session.send(&Message::error("udid is required")).await;
        return None;
    }
    let role = message
        .body_str("role")
        .and_then(PeerRole::parse)
        .unwrap_or(PeerRole::Device);

    Some(session.handle(peer_id, role))
}

async fn route(services: &Services, handle: &SessionHandle, message: Message) {
    match (handle.role, message.msg_type.as_str()) {
        (PeerRole::Device, msg_type::SCRIPT_PUSH_REPORT) => {
            let completion = services
                .launcher
                .handle_push_report(&handle.peer_id, message.body.as_ref())
                .await;
            debug!("Push report from {}: {:?}", handle.peer_id, completion);
        }
        (PeerRole::Controller, msg_type::SCRIPT_DEPLOY) => {
            let reply = match deploy(services, message.body).await {
                Ok(body) => Message::new(msg_type::SCRIPT_DEPLOY, Some(body)),
                Err(e) => {
                    warn!("Deploy from {} refused: {:#}", handle.peer_id, e);
                    Message::error(format!("{e:#}"))
                }
            };
            if let Err(e) = handle.send(&reply).await {
                warn!("Failed to reply to {}: {}", handle.peer_id, e);
            }
        }
        (role, other) => debug!("Ignoring {} from {:?} {}", other, role, handle.peer_id),
    }
}

async fn deploy(services: &Services, body: Option<Value>) -> anyhow::Result<Value> {
    let command: DeployCommand = serde_json::from_value(body.unwrap_or(Value::Null))?;
    let script = resolve_script(&services.scripts_dir, &command.name).await?;
    let run_payload = command
        .run_message
        .map(|run| serde_json::to_vec(&run))
        .transpose()?
        .map(Into::into);

    let report = services
        .launcher
        .deploy(DeployRequest {
            deployment_id: command.deployment_id.clone(),
            devices: command.devices,
            script_path: script.path,
            display_name: script.display_name,
            is_dir: script.is_dir,
            piled: script.piled,
            run_name: script.run_name,
            run_payload,
            staged: command.staged.map(|staged| StagedArtifact {
                shared_id: staged.shared_id,
                path: staged.path,
            }),
        })
        .await?;

    Ok(json!({
        "deploymentId": command.deployment_id,
        "accepted": report.accepted,
        "busy": report.busy,
    }))
}
