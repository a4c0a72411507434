//! Script deployment workflow
//!
//! Pushes a script package to a set of devices, waits for every device to
//! report that the push landed, then starts the script everywhere at once.
//! A single failing device cancels the start for all of them.

use super::package_cache::{ScriptFile, ScriptPackageCache};
use super::pending::{Completion, PendingStartCoordinator, ReadyStart, StartOutcome};
use super::temp_ref::{is_staged_path, SharedTempRefs};
use crate::error::LaunchError;
use async_trait::async_trait;
use bytes::Bytes;
use fleet_shared::{codec, msg_type, Message};
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEVICE_OFFLINE: &str = "device offline";

/// Where the launcher sends messages
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Send one already-serialized message to a connected peer
    async fn send_frame(&self, peer_id: &str, payload: Bytes) -> anyhow::Result<()>;

    /// Deliver a message to every connected controller
    async fn notify_controllers(&self, message: Message);
}

/// A staged artifact shared by every device of a deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub shared_id: String,
    pub path: PathBuf,
}

/// Request to push a script to devices and start it once all have it
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub deployment_id: String,
    pub devices: Vec<String>,
    /// Script file or directory on disk
    pub script_path: PathBuf,
    /// Name the script is installed under
    pub display_name: String,
    pub is_dir: bool,
    pub piled: bool,
    pub run_name: String,
    /// Complete `script/run` message to forward verbatim instead of building one
    pub run_payload: Option<Bytes>,
    pub staged: Option<StagedArtifact>,
}

/// Devices a deployment went out to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    pub accepted: Vec<String>,
    /// Skipped because a previous start on them is still in flight
    pub busy: Vec<String>,
}

struct Deployment {
    /// Coordinator generation this deployment registered as
    generation: u64,
    devices: Vec<String>,
    staged_id: Option<String>,
    /// Devices still holding a reference on the staged artifact
    ref_holders: HashSet<String>,
}

#[derive(Default)]
struct LaunchState {
    in_flight: HashSet<String>,
    deployments: HashMap<String, Deployment>,
}

/// Drives deployments through the coordinator, temp refs and package cache
#[derive(Clone)]
pub struct ScriptLauncher {
    coordinator: Arc<PendingStartCoordinator>,
    temp_refs: Arc<SharedTempRefs>,
    cache: Arc<ScriptPackageCache>,
    peers: Arc<dyn PeerDirectory>,
    state: Arc<Mutex<LaunchState>>,
}

impl ScriptLauncher {
    pub fn new(
        coordinator: Arc<PendingStartCoordinator>,
        temp_refs: Arc<SharedTempRefs>,
        cache: Arc<ScriptPackageCache>,
        peers: Arc<dyn PeerDirectory>,
    ) -> Self {
        Self {
            coordinator,
            temp_refs,
            cache,
            peers,
            state: Arc::new(Mutex::new(LaunchState::default())),
        }
    }

    /// Follow wait-timer expirations so starts cancelled by the timer are
    /// cleaned up too
    ///
    /// Reports and send failures are finished inline; only the timer needs a
    /// watcher. Expirations raised before the watcher starts are still seen.
    pub fn start_expiry_watcher(&self) -> JoinHandle<()> {
        let launcher = self.clone();
        tokio::spawn(async move {
            let Some(mut expired) = launcher.coordinator.take_expirations().await else {
                warn!("Expiry watcher already running");
                return;
            };
            while let Some(outcome) = expired.recv().await {
                launcher.on_outcome(outcome).await;
            }
        })
    }

    /// Push a script package to every requested device
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployReport, LaunchError> {
        let key = request.deployment_id.trim().to_string();
        if key.is_empty() {
            return Err(LaunchError::MissingDeploymentId);
        }
        let devices: BTreeSet<String> = request
            .devices
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        if devices.is_empty() {
            return Err(LaunchError::NoTargets);
        }
        if let Some(staged) = &request.staged {
            if !is_staged_path(&staged.path) {
                return Err(LaunchError::NotStaged(staged.path.clone()));
            }
        }

        let files = self
            .cache
            .collect(
                &request.script_path,
                &request.display_name,
                request.is_dir,
                request.piled,
            )
            .await?;

        let (run_payload, prepared) = match request.run_payload.clone() {
            Some(payload) => (payload, true),
            None => (Bytes::new(), false),
        };

        // Registration happens under the state lock so the stored generation
        // always names the coordinator entry for this key
        let (generation, accepted, busy, replaced) = {
            let mut state = self.state.lock().await;
            // Reusing a live deployment id supersedes it
            let replaced = state.deployments.remove(&key);
            if let Some(old) = &replaced {
                for device in &old.devices {
                    state.in_flight.remove(device);
                }
            }

            let (accepted, busy): (Vec<String>, Vec<String>) = devices
                .into_iter()
                .partition(|device| !state.in_flight.contains(device));
            let generation = if accepted.is_empty() {
                None
            } else {
                self.coordinator
                    .register(&key, run_payload, prepared, request.run_name.as_str(), &accepted)
                    .await
            };
            let Some(generation) = generation else {
                if let Some(old) = replaced {
                    state.in_flight.extend(old.devices.iter().cloned());
                    state.deployments.insert(key, old);
                }
                return Err(if accepted.is_empty() {
                    LaunchError::Busy(busy.join(", "))
                } else {
                    LaunchError::NoTargets
                });
            };

            let mut ref_holders = HashSet::new();
            if let Some(staged) = &request.staged {
                for device in &accepted {
                    self.temp_refs.register_ref(&staged.shared_id, &staged.path).await;
                    ref_holders.insert(device.clone());
                }
            }
            for device in &accepted {
                state.in_flight.insert(device.clone());
            }
            state.deployments.insert(
                key.clone(),
                Deployment {
                    generation,
                    devices: accepted.clone(),
                    staged_id: request.staged.as_ref().map(|s| s.shared_id.clone()),
                    ref_holders,
                },
            );
            (generation, accepted, busy, replaced)
        };
        if let Some(old) = replaced {
            debug!("Deployment {} generation {} superseded", key, old.generation);
            self.release_refs(&old).await;
        }

        for device in &busy {
            self.notify(
                device,
                "script start cancelled: previous start has not finished",
            )
            .await;
        }

        let push = Message::new(
            msg_type::SCRIPT_PUSH,
            Some(push_body(&key, &request, &files)),
        );
        let payload = match codec::to_payload(&push) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode script push {}: {}", key, e);
                self.coordinator.clear(&key).await;
                if let Some(deployment) = self.conclude(&key, generation).await {
                    self.release_refs(&deployment).await;
                }
                return Err(LaunchError::Encode(e));
            }
        };

        info!(
            "Deploying {} ({} files) to {} device(s) as {}",
            request.display_name,
            files.len(),
            accepted.len(),
            key
        );

        let sends = accepted.iter().map(|device| {
            let payload = payload.clone();
            async move { (device, self.peers.send_frame(device, payload).await) }
        });
        for (device, result) in join_all(sends).await {
            if let Err(e) = result {
                warn!("Script push to {} failed: {}", device, e);
                self.release_device_ref(&key, device).await;
                let (completion, applied) = self
                    .coordinator
                    .complete_tracked(&key, device, false, DEVICE_OFFLINE)
                    .await;
                self.react(&key, applied, completion).await;
            }
        }

        Ok(DeployReport { accepted, busy })
    }

    /// Apply a device's `script/push/report`
    pub async fn handle_push_report(&self, device: &str, body: Option<&Value>) -> Completion {
        let Some(report) = body.and_then(PushReport::parse) else {
            debug!("Ignoring malformed push report from {}", device);
            return Completion::Ignored;
        };

        self.release_device_ref(&report.deployment_id, device).await;
        let (completion, generation) = self
            .coordinator
            .complete_tracked(&report.deployment_id, device, report.success, &report.error)
            .await;
        self.react(&report.deployment_id, generation, completion.clone())
            .await;
        completion
    }

    /// Whether `device` has a start in flight
    pub async fn is_busy(&self, device: &str) -> bool {
        self.state.lock().await.in_flight.contains(device)
    }

    /// Number of deployments still waiting on devices
    pub async fn active_deployments(&self) -> usize {
        self.state.lock().await.deployments.len()
    }

    async fn react(&self, key: &str, generation: Option<u64>, completion: Completion) {
        let Some(generation) = generation else {
            return;
        };
        if let Some(outcome) = StartOutcome::from_completion(key, generation, completion) {
            self.on_outcome(outcome).await;
        }
    }

    /// Finish a deployment; runs once per deployment whichever path sees it
    /// first, and never for a later deployment reusing the key
    async fn on_outcome(&self, outcome: StartOutcome) {
        let Some(deployment) = self.conclude(outcome.key(), outcome.generation()).await else {
            debug!(
                "Outcome for {} generation {} no longer current",
                outcome.key(),
                outcome.generation()
            );
            return;
        };
        self.release_refs(&deployment).await;

        match outcome {
            StartOutcome::Ready { key, start, .. } => {
                info!("All devices ready for {}, starting {}", key, start.run_name);
                self.start_script(&start).await;
            }
            StartOutcome::Cancelled { key, reason, .. } => {
                warn!("Script start {} cancelled: {}", key, reason);
                for device in &deployment.devices {
                    self.notify(device, &format!("script start cancelled: {reason}"))
                        .await;
                }
            }
        }
    }

    async fn start_script(&self, start: &ReadyStart) {
        let payload = if start.run_payload_prepared {
            start.run_payload.clone()
        } else {
            let run = Message::new(msg_type::SCRIPT_RUN, Some(json!({ "name": start.run_name })));
            match codec::to_payload(&run) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to encode script run: {}", e);
                    return;
                }
            }
        };

        let sends = start.targets.iter().map(|device| {
            let payload = payload.clone();
            async move { (device, self.peers.send_frame(device, payload).await) }
        });
        for (device, result) in join_all(sends).await {
            match result {
                Ok(()) => self.notify(device, "script started").await,
                Err(e) => {
                    warn!("Script run to {} failed: {}", device, e);
                    self.notify(device, "script start failed: device offline").await;
                }
            }
        }
    }

    /// Remove a deployment and free its devices, if `generation` is current
    async fn conclude(&self, key: &str, generation: u64) -> Option<Deployment> {
        let mut state = self.state.lock().await;
        if state.deployments.get(key)?.generation != generation {
            return None;
        }
        let deployment = state.deployments.remove(key)?;
        for device in &deployment.devices {
            state.in_flight.remove(device);
        }
        Some(deployment)
    }

    async fn release_refs(&self, deployment: &Deployment) {
        if let Some(shared_id) = &deployment.staged_id {
            for _ in &deployment.ref_holders {
                self.temp_refs.release_ref(shared_id).await;
            }
        }
    }

    async fn release_device_ref(&self, key: &str, device: &str) {
        let shared_id = {
            let mut state = self.state.lock().await;
            let Some(deployment) = state.deployments.get_mut(key) else {
                return;
            };
            if !deployment.ref_holders.remove(device) {
                return;
            }
            deployment.staged_id.clone()
        };
        if let Some(shared_id) = shared_id {
            self.temp_refs.release_ref(&shared_id).await;
        }
    }

    async fn notify(&self, device: &str, text: &str) {
        let message = Message::new(msg_type::DEVICE_MESSAGE, Some(json!({ "message": text })))
            .with_udid(device);
        self.peers.notify_controllers(message).await;
    }
}

fn push_body(key: &str, request: &DeployRequest, files: &[ScriptFile]) -> Value {
    let files: Vec<Value> = files
        .iter()
        .map(|file| {
            let mut entry = json!({
                "name": file.name,
                "size": file.size,
                "isMainJson": file.is_main_json,
            });
            if let Some(data) = &file.data {
                entry["data"] = Value::String(data.clone());
            }
            entry
        })
        .collect();

    let mut body = json!({
        "deploymentId": key,
        "name": request.display_name,
        "runName": request.run_name,
        "files": files,
    });
    if let Some(staged) = &request.staged {
        body["sharedId"] = Value::String(staged.shared_id.clone());
    }
    body
}

#[derive(Debug, PartialEq)]
struct PushReport {
    deployment_id: String,
    success: bool,
    error: String,
}

impl PushReport {
    fn parse(body: &Value) -> Option<Self> {
        let deployment_id = body.get("deploymentId")?.as_str()?.trim();
        if deployment_id.is_empty() {
            return None;
        }
        let success = match body.get("success") {
            Some(Value::Bool(value)) => *value,
            Some(Value::String(value)) => value.eq_ignore_ascii_case("true"),
            Some(Value::Number(value)) => value.as_f64().map_or(false, |v| v != 0.0),
            _ => false,
        };
        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self {
            deployment_id: deployment_id.to_string(),
            success,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::time::Duration;

    #[derive(Default)]
    struct RecordingPeers {
        offline: HashSet<String>,
        sent: Mutex<Vec<(String, Message)>>,
        notices: Mutex<Vec<Message>>,
    }

    impl RecordingPeers {
        fn with_offline(devices: &[&str]) -> Self {
            Self {
                offline: devices.iter().map(|d| d.to_string()).collect(),
                ..Default::default()
            }
        }

        async fn sent_of_type(&self, kind: &str) -> Vec<(String, Message)> {
            self.sent
                .lock()
                .await
                .iter()
                .filter(|(_, m)| m.msg_type == kind)
                .cloned()
                .collect()
        }

        async fn notice_texts(&self) -> Vec<String> {
            self.notices
                .lock()
                .await
                .iter()
                .filter_map(|m| m.body_str("message").map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl PeerDirectory for RecordingPeers {
        async fn send_frame(&self, peer_id: &str, payload: Bytes) -> anyhow::Result<()> {
            if self.offline.contains(peer_id) {
                anyhow::bail!("peer not connected: {}", peer_id);
            }
            let message: Message = serde_json::from_slice(&payload)?;
            self.sent.lock().await.push((peer_id.to_string(), message));
            Ok(())
        }

        async fn notify_controllers(&self, message: Message) {
            self.notices.lock().await.push(message);
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        peers: Arc<RecordingPeers>,
        coordinator: Arc<PendingStartCoordinator>,
        temp_refs: Arc<SharedTempRefs>,
        launcher: ScriptLauncher,
    }

    fn fixture_with(peers: RecordingPeers, wait: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.lua"), b"print('hi')").unwrap();
        let peers = Arc::new(peers);
        let coordinator = Arc::new(PendingStartCoordinator::new(wait));
        let temp_refs = Arc::new(SharedTempRefs::new(Duration::from_millis(40)));
        let launcher = ScriptLauncher::new(
            coordinator.clone(),
            temp_refs.clone(),
            Arc::new(ScriptPackageCache::new()),
            peers.clone(),
        );
        Fixture {
            dir,
            peers,
            coordinator,
            temp_refs,
            launcher,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingPeers::default(), Duration::ZERO)
    }

    fn request(dir: &Path, id: &str, devices: &[&str]) -> DeployRequest {
        DeployRequest {
            deployment_id: id.into(),
            devices: devices.iter().map(|d| d.to_string()).collect(),
            script_path: dir.join("hello.lua"),
            display_name: "hello.lua".into(),
            run_name: "hello.lua".into(),
            ..Default::default()
        }
    }

    fn staged(dir: &Path) -> StagedArtifact {
        let temp = dir.join("_temp");
        std::fs::create_dir_all(&temp).unwrap();
        let path = temp.join("blob.bin");
        std::fs::write(&path, b"large").unwrap();
        StagedArtifact {
            shared_id: "blob-1".into(),
            path,
        }
    }

    fn report(id: &str, success: Value, error: &str) -> Value {
        json!({ "deploymentId": id, "success": success, "error": error })
    }

    #[tokio::test]
    async fn test_push_then_start_on_all_devices() {
        let fx = fixture();
        let result = fx
            .launcher
            .deploy(request(fx.dir.path(), "d-1", &["dev-a", "dev-b", "dev-a"]))
            .await
            .unwrap();
        assert_eq!(result.accepted, vec!["dev-a".to_string(), "dev-b".to_string()]);

        let pushes = fx.peers.sent_of_type(msg_type::SCRIPT_PUSH).await;
        assert_eq!(pushes.len(), 2);
        let body = pushes[0].1.body.as_ref().unwrap();
        assert_eq!(body["deploymentId"], "d-1");
        assert_eq!(body["files"][0]["name"], "lua/scripts/hello.lua");

        let first = fx
            .launcher
            .handle_push_report("dev-a", Some(&report("d-1", json!(true), "")))
            .await;
        assert_eq!(first, Completion::Progress { remaining: 1 });
        assert!(fx.peers.sent_of_type(msg_type::SCRIPT_RUN).await.is_empty());

        let last = fx
            .launcher
            .handle_push_report("dev-b", Some(&report("d-1", json!("true"), "")))
            .await;
        assert!(matches!(last, Completion::Ready(_)));

        let runs = fx.peers.sent_of_type(msg_type::SCRIPT_RUN).await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].1.body_str("name"), Some("hello.lua"));
        assert!(!fx.launcher.is_busy("dev-a").await);
        assert_eq!(fx.launcher.active_deployments().await, 0);
    }

    #[tokio::test]
    async fn test_prepared_run_payload_forwarded_verbatim() {
        let fx = fixture();
        let mut req = request(fx.dir.path(), "d-2", &["dev-a"]);
        req.run_payload = Some(Bytes::from_static(
            br#"{"type":"script/run","body":{"name":"custom"}}"#,
        ));
        fx.launcher.deploy(req).await.unwrap();
        fx.launcher
            .handle_push_report("dev-a", Some(&report("d-2", json!(1), "")))
            .await;

        let runs = fx.peers.sent_of_type(msg_type::SCRIPT_RUN).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].1.body_str("name"), Some("custom"));
    }

    #[tokio::test]
    async fn test_failure_cancels_and_notifies() {
        let fx = fixture();
        fx.launcher
            .deploy(request(fx.dir.path(), "d-3", &["dev-a", "dev-b"]))
            .await
            .unwrap();

        let completion = fx
            .launcher
            .handle_push_report("dev-a", Some(&report("d-3", json!(false), "disk full")))
            .await;
        assert_eq!(completion, Completion::Cancelled("disk full".into()));

        let late = fx
            .launcher
            .handle_push_report("dev-b", Some(&report("d-3", json!(true), "")))
            .await;
        assert_eq!(late, Completion::Ignored);

        assert!(fx.peers.sent_of_type(msg_type::SCRIPT_RUN).await.is_empty());
        let notices = fx.peers.notice_texts().await;
        assert_eq!(
            notices
                .iter()
                .filter(|n| *n == "script start cancelled: disk full")
                .count(),
            2
        );
        assert!(!fx.launcher.is_busy("dev-b").await);
    }

    #[tokio::test]
    async fn test_offline_device_fails_the_start() {
        let fx = fixture_with(RecordingPeers::with_offline(&["dev-b"]), Duration::ZERO);
        fx.launcher
            .deploy(request(fx.dir.path(), "d-4", &["dev-a", "dev-b"]))
            .await
            .unwrap();

        assert!(!fx.coordinator.contains("d-4").await);
        let notices = fx.peers.notice_texts().await;
        assert!(notices.contains(&"script start cancelled: device offline".to_string()));
    }

    #[tokio::test]
    async fn test_busy_device_is_skipped() {
        let fx = fixture();
        fx.launcher
            .deploy(request(fx.dir.path(), "d-5", &["dev-a"]))
            .await
            .unwrap();

        let second = fx
            .launcher
            .deploy(request(fx.dir.path(), "d-6", &["dev-a", "dev-b"]))
            .await
            .unwrap();
        assert_eq!(second.accepted, vec!["dev-b".to_string()]);
        assert_eq!(second.busy, vec!["dev-a".to_string()]);

        let third = fx
            .launcher
            .deploy(request(fx.dir.path(), "d-7", &["dev-a"]))
            .await;
        assert!(matches!(third, Err(LaunchError::Busy(_))));
    }

    #[tokio::test]
    async fn test_staged_refs_follow_reports() {
        let fx = fixture();
        let artifact = staged(fx.dir.path());
        let mut req = request(fx.dir.path(), "d-8", &["dev-a", "dev-b"]);
        req.staged = Some(artifact.clone());
        fx.launcher.deploy(req).await.unwrap();
        assert_eq!(fx.temp_refs.ref_count("blob-1").await, Some(2));

        fx.launcher
            .handle_push_report("dev-a", Some(&report("d-8", json!(true), "")))
            .await;
        assert_eq!(fx.temp_refs.ref_count("blob-1").await, Some(1));

        // Cancellation releases the holder that never reported
        fx.launcher
            .handle_push_report("dev-b", Some(&report("d-8", json!(false), "")))
            .await;
        assert_eq!(fx.temp_refs.ref_count("blob-1").await, Some(0));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!artifact.path.exists());
    }

    #[tokio::test]
    async fn test_wait_timer_cancellation_is_cleaned_up() {
        let fx = fixture_with(RecordingPeers::default(), Duration::from_millis(50));
        let watcher = fx.launcher.start_expiry_watcher();
        let artifact = staged(fx.dir.path());
        let mut req = request(fx.dir.path(), "d-9", &["dev-a"]);
        req.staged = Some(artifact);
        fx.launcher.deploy(req).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!fx.launcher.is_busy("dev-a").await);
        // Released, possibly already past its grace period
        assert_ne!(fx.temp_refs.ref_count("blob-1").await, Some(1));
        let notices = fx.peers.notice_texts().await;
        assert!(notices
            .iter()
            .any(|n| n.starts_with("script start cancelled: timed out")));
        watcher.abort();
    }

    #[tokio::test]
    async fn test_rejected_requests() {
        let fx = fixture();
        let dir = fx.dir.path();

        let mut req = request(dir, " ", &["dev-a"]);
        assert!(matches!(
            fx.launcher.deploy(req.clone()).await,
            Err(LaunchError::MissingDeploymentId)
        ));

        req.deployment_id = "d-10".into();
        req.devices = vec!["  ".into()];
        assert!(matches!(
            fx.launcher.deploy(req.clone()).await,
            Err(LaunchError::NoTargets)
        ));

        req.devices = vec!["dev-a".into()];
        req.staged = Some(StagedArtifact {
            shared_id: "x".into(),
            path: dir.join("hello.lua"),
        });
        assert!(matches!(
            fx.launcher.deploy(req.clone()).await,
            Err(LaunchError::NotStaged(_))
        ));

        req.staged = None;
        req.script_path = dir.join("missing.lua");
        assert!(matches!(
            fx.launcher.deploy(req).await,
            Err(LaunchError::Package(_))
        ));
        assert!(!fx.launcher.is_busy("dev-a").await);
    }

    #[test]
    fn test_push_report_parsing() {
        let parsed = PushReport::parse(&report("d", json!("TRUE"), "")).unwrap();
        assert!(parsed.success);
        assert!(!PushReport::parse(&report("d", json!(0), "")).unwrap().success);
        assert!(PushReport::parse(&report("d", json!(2.5), "")).unwrap().success);
        assert!(!PushReport::parse(&json!({ "deploymentId": "d" })).unwrap().success);
        assert_eq!(
            PushReport::parse(&report("d", json!(false), "boom")).unwrap().error,
            "boom"
        );
        assert!(PushReport::parse(&json!({ "success": true })).is_none());
        assert!(PushReport::parse(&json!({ "deploymentId": " " })).is_none());
    }

    #[tokio::test]
    async fn test_redeploy_same_id_while_watching() {
        let fx = fixture_with(RecordingPeers::default(), Duration::from_secs(5));
        let watcher = fx.launcher.start_expiry_watcher();
        let mut outcomes = fx.coordinator.subscribe();

        fx.launcher
            .deploy(request(fx.dir.path(), "d", &["dev-a"]))
            .await
            .unwrap();
        fx.launcher
            .handle_push_report("dev-a", Some(&report("d", json!(false), "disk full")))
            .await;
        fx.launcher
            .deploy(request(fx.dir.path(), "d", &["dev-a"]))
            .await
            .unwrap();

        // The first deployment's cancellation is still queued for observers
        let stale = outcomes.recv().await.unwrap();
        assert!(matches!(stale, StartOutcome::Cancelled { .. }));
        fx.launcher.on_outcome(stale).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.launcher.is_busy("dev-a").await);
        assert!(fx.coordinator.contains("d").await);

        let completion = fx
            .launcher
            .handle_push_report("dev-a", Some(&report("d", json!(true), "")))
            .await;
        assert!(matches!(completion, Completion::Ready(_)));
        assert_eq!(fx.peers.sent_of_type(msg_type::SCRIPT_RUN).await.len(), 1);
        assert!(!fx.launcher.is_busy("dev-a").await);
        watcher.abort();
    }

    #[tokio::test]
    async fn test_many_expirations_all_cleaned_up() {
        let fx = fixture_with(RecordingPeers::default(), Duration::from_millis(50));
        let devices: Vec<String> = (0..100).map(|i| format!("dev-{i}")).collect();
        for device in &devices {
            fx.launcher
                .deploy(request(fx.dir.path(), device, &[device.as_str()]))
                .await
                .unwrap();
        }

        // Every timer fires before anything is watching
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fx.coordinator.is_empty().await);
        assert_eq!(fx.launcher.active_deployments().await, devices.len());

        let watcher = fx.launcher.start_expiry_watcher();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.launcher.active_deployments().await, 0);
        for device in &devices {
            assert!(!fx.launcher.is_busy(device).await);
        }
        watcher.abort();
    }

    #[tokio::test]
    async fn test_staged_path_escaping_temp_dir_rejected() {
        let fx = fixture();
        let dir = fx.dir.path();
        std::fs::create_dir_all(dir.join("_temp")).unwrap();
        let victim = dir.join("precious.txt");
        std::fs::write(&victim, b"keep me").unwrap();

        let mut req = request(dir, "d-11", &["dev-a"]);
        req.staged = Some(StagedArtifact {
            shared_id: "escape".into(),
            path: dir.join("_temp").join("..").join("precious.txt"),
        });
        assert!(matches!(
            fx.launcher.deploy(req).await,
            Err(LaunchError::NotStaged(_))
        ));
        assert_eq!(fx.temp_refs.ref_count("escape").await, None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(victim.exists());
        assert!(!fx.launcher.is_busy("dev-a").await);
    }
}
