//! End-to-end cascade tests: a controller over an in-memory backend, with
//! a scripted executor standing in for the job runner.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use serde_json::Map;

use div_core::{
    ApplicationSpec, Config, DeploymentSpec, InstallPhase, InstallSpec, Kind, KindSpec,
    ProjectSpec, Resource,
};
use div_gateway::{
    Controller, ExecError, Executor, GatewayError, GatewayResult, JobSubmission, RecoveryPolicy,
    SubmitFuture, Targets,
};
use div_state::{
    Backend, Item, LogEvent, LogStore, RedbBackend, ResourceStore, ShardDescription,
    ShardRecords, StateError, StateResult,
};

/// Records every submission and succeeds unless told to fail.
#[derive(Clone, Default)]
struct ScriptedExecutor {
    jobs: Arc<Mutex<Vec<JobSubmission>>>,
    fail: bool,
}

impl ScriptedExecutor {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn jobs(&self) -> Vec<JobSubmission> {
        self.jobs.lock().unwrap().clone()
    }
}

impl Executor for ScriptedExecutor {
    fn submit<'a>(
        &'a self,
        job: &'a JobSubmission,
        sink: &'a mut (dyn Write + Send),
    ) -> SubmitFuture<'a> {
        Box::pin(async move {
            self.jobs.lock().unwrap().push(job.clone());
            writeln!(sink, "installing {} at {}", job.namespace, job.commit)?;
            if self.fail {
                return Err(ExecError::Failed { code: Some(1) });
            }
            Ok(())
        })
    }
}

/// Delegates to an in-memory backend; `break_next` makes the next stream
/// listing of one table fail once.
struct FlakyStreamBackend {
    inner: RedbBackend,
    broken: Mutex<Option<String>>,
}

impl FlakyStreamBackend {
    fn new() -> Self {
        Self {
            inner: RedbBackend::open_in_memory().unwrap().with_shard_capacity(8),
            broken: Mutex::new(None),
        }
    }

    fn break_next(&self, table_suffix: &str) {
        *self.broken.lock().unwrap() = Some(table_suffix.to_string());
    }
}

impl Backend for FlakyStreamBackend {
    fn create_table(&self, table: &str) -> StateResult<()> {
        self.inner.create_table(table)
    }
    fn table_exists(&self, table: &str) -> StateResult<bool> {
        self.inner.table_exists(table)
    }
    fn get_item(&self, table: &str, key: &str) -> StateResult<Option<Item>> {
        self.inner.get_item(table, key)
    }
    fn scan(&self, table: &str) -> StateResult<Vec<Item>> {
        self.inner.scan(table)
    }
    fn put_item(&self, table: &str, item: &Item) -> StateResult<()> {
        self.inner.put_item(table, item)
    }
    fn delete_item(&self, table: &str, key: &str) -> StateResult<bool> {
        self.inner.delete_item(table, key)
    }
    fn describe_stream(&self, table: &str) -> StateResult<Vec<ShardDescription>> {
        let mut broken = self.broken.lock().unwrap();
        if broken.as_deref().is_some_and(|suffix| table.ends_with(suffix)) {
            *broken = None;
            return Err(StateError::Feed(format!("{table}: stream unavailable")));
        }
        drop(broken);
        self.inner.describe_stream(table)
    }
    fn get_records(
        &self,
        table: &str,
        shard_id: u64,
        after: Option<u64>,
        limit: usize,
    ) -> StateResult<ShardRecords> {
        self.inner.get_records(table, shard_id, after, limit)
    }
    fn ensure_log_stream(&self, group: &str, stream: &str) -> StateResult<()> {
        self.inner.ensure_log_stream(group, stream)
    }
    fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[(u64, String)],
    ) -> StateResult<()> {
        self.inner.put_log_events(group, stream, events)
    }
    fn filter_log_events(
        &self,
        group: &str,
        stream_prefix: &str,
        start_ms: Option<u64>,
    ) -> StateResult<Vec<LogEvent>> {
        self.inner.filter_log_events(group, stream_prefix, start_ms)
    }
    fn delete_log_group(&self, group: &str) -> StateResult<bool> {
        self.inner.delete_log_group(group)
    }
}

struct Harness {
    store: ResourceStore,
    logs: LogStore,
    executor: ScriptedExecutor,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<GatewayResult<()>>>,
}

impl Harness {
    /// A namespace with project `myproj` and application `app1`.
    fn new() -> Self {
        let backend = RedbBackend::open_in_memory().unwrap().with_shard_capacity(8);
        Self::over(Arc::new(backend))
    }

    fn over(backend: Arc<dyn Backend>) -> Self {
        let store = ResourceStore::new(backend, "mydb", "production")
            .with_poll_interval(Duration::from_millis(10));
        store
            .provision(&Config::scaffold("mydb").spec.custom_resource_definitions)
            .unwrap();
        store
            .apply(&ProjectSpec {}.into_resource("myproj").unwrap())
            .unwrap();
        store
            .apply(
                &ApplicationSpec {
                    project: "myproj".into(),
                }
                .into_resource("app1")
                .unwrap(),
            )
            .unwrap();
        let logs = LogStore::for_store(&store).with_poll_interval(Duration::from_millis(10));
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            logs,
            executor: ScriptedExecutor::default(),
            shutdown,
            handle: None,
        }
    }

    fn with_executor(mut self, executor: ScriptedExecutor) -> Self {
        self.executor = executor;
        self
    }

    fn start(&mut self, policy: RecoveryPolicy) {
        let targets = Targets::resolve(&self.store, "prod1", Some("myproj"), None).unwrap();
        let controller = Controller::new(
            self.store.clone(),
            self.logs.clone(),
            targets,
            self.executor.clone(),
        )
        .with_policy(policy);
        let shutdown = self.shutdown.subscribe();
        self.handle = Some(tokio::spawn(async move { controller.run(shutdown).await }));
    }

    fn deploy(&self, name: &str, project: &str, sha1: &str) {
        let spec = DeploymentSpec {
            project: project.into(),
            app: "app1".into(),
            sha1: sha1.into(),
        };
        self.store.apply(&spec.into_resource(name).unwrap()).unwrap();
    }

    fn phase(&self, install: &str) -> Option<String> {
        self.store
            .get_optional(Kind::Install, install)
            .unwrap()
            .and_then(|r| r.spec_str("phase").map(str::to_string))
    }

    async fn wait_for_phase(&self, install: &str, phase: &str) {
        for _ in 0..500 {
            if self.phase(install).as_deref() == Some(phase) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "install {install} never reached {phase}, last seen {:?}",
            self.phase(install)
        );
    }

    fn count(&self, kind: Kind) -> usize {
        match self.store.get(kind, None, &[]) {
            Ok(found) => found.len(),
            Err(e) if e.is_not_found() => 0,
            Err(e) => panic!("{e}"),
        }
    }

    /// Wait for the controller to stop on its own.
    async fn finished(&mut self) -> GatewayResult<()> {
        let handle = self.handle.take().expect("controller not started");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("gateway kept running")
            .unwrap()
    }

    fn still_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    async fn stop(mut self) -> GatewayResult<()> {
        self.shutdown.send(true).unwrap();
        let handle = self.handle.take().expect("controller not started");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("controller did not stop")
            .unwrap()
    }
}

/// Give the change feed a few poll rounds.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn deployment_cascades_to_a_completed_install() {
    let mut h = Harness::new();
    h.start(RecoveryPolicy::default());
    h.deploy("app1", "myproj", "abc");

    h.wait_for_phase("app1-prod1-abc", "completed").await;

    let release = h.store.get_optional(Kind::Release, "app1-prod1").unwrap().unwrap();
    assert_eq!(release.spec_str("sha1"), Some("abc"));
    assert_eq!(release.spec_str("cluster"), Some("prod1"));

    let install = h.store.get_optional(Kind::Install, "app1-prod1-abc").unwrap().unwrap();
    let spec = InstallSpec::decode(&install).unwrap();
    assert_eq!(spec.phase, InstallPhase::Completed);
    assert!(spec.started_at.is_some());

    settle().await;
    let jobs = h.executor.jobs();
    assert_eq!(jobs.len(), 1, "the install must run exactly once");
    assert_eq!(jobs[0].namespace, "myproj");
    assert_eq!(jobs[0].event, "div:install");
    assert_eq!(jobs[0].commit, "abc");
    assert!(jobs[0].payload.contains("--environment=production"));
    assert!(jobs[0].payload.contains("-l=name=app1"));
    assert!(jobs[0].payload.contains("--set=ref=abc"));

    h.stop().await.unwrap();
}

#[tokio::test]
async fn reapplying_the_same_sha1_creates_nothing_new() {
    let mut h = Harness::new();
    h.start(RecoveryPolicy::default());
    h.deploy("app1", "myproj", "abc");
    h.wait_for_phase("app1-prod1-abc", "completed").await;

    h.deploy("app1", "myproj", "abc");
    h.deploy("app1", "myproj", "abc");
    settle().await;

    assert_eq!(h.count(Kind::Release), 1);
    assert_eq!(h.count(Kind::Install), 1);
    assert_eq!(h.executor.jobs().len(), 1);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn a_new_sha1_produces_a_second_install() {
    let mut h = Harness::new();
    h.start(RecoveryPolicy::default());
    h.deploy("app1", "myproj", "abc");
    h.wait_for_phase("app1-prod1-abc", "completed").await;

    h.deploy("app1", "myproj", "def");
    h.wait_for_phase("app1-prod1-def", "completed").await;

    let release = h.store.get_optional(Kind::Release, "app1-prod1").unwrap().unwrap();
    assert_eq!(release.spec_str("sha1"), Some("def"));
    assert_eq!(h.count(Kind::Install), 2);
    let commits: Vec<String> = h.executor.jobs().into_iter().map(|j| j.commit).collect();
    assert_eq!(commits, ["abc", "def"]);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn failed_job_marks_the_install_failed_and_keeps_logs() {
    let mut h = Harness::new().with_executor(ScriptedExecutor::failing());
    h.start(RecoveryPolicy::default());
    h.deploy("app1", "myproj", "abc");

    h.wait_for_phase("app1-prod1-abc", "failed").await;

    let (_tx, shutdown) = watch::channel(false);
    let mut tail = h
        .logs
        .read(Kind::Install, "app1-prod1-abc", None, false, shutdown)
        .unwrap();
    let mut lines = Vec::new();
    while let Some(line) = tail.messages.recv().await {
        lines.push(line);
    }
    assert_eq!(lines[0], "installing myproj at abc");
    assert!(lines[1].starts_with("job failed:"));

    // The gateway keeps running after a failed job.
    settle().await;
    assert_eq!(h.executor.jobs().len(), 1);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn untargeted_projects_are_ignored() {
    let mut h = Harness::new();
    h.store
        .apply(&ProjectSpec {}.into_resource("other").unwrap())
        .unwrap();
    h.start(RecoveryPolicy::default());

    h.deploy("app1-other", "other", "abc");
    settle().await;

    assert_eq!(h.count(Kind::Release), 0);
    assert!(h.executor.jobs().is_empty());
    h.stop().await.unwrap();
}

#[tokio::test]
async fn deployments_from_before_startup_are_reconciled() {
    let mut h = Harness::new();
    h.deploy("app1", "myproj", "abc");
    h.start(RecoveryPolicy::default());

    h.wait_for_phase("app1-prod1-abc", "completed").await;
    h.stop().await.unwrap();
}

#[tokio::test]
async fn releases_for_other_clusters_are_ignored() {
    let mut h = Harness::new();
    h.start(RecoveryPolicy::default());

    let release = div_core::ReleaseSpec {
        project: "myproj".into(),
        app: "app1".into(),
        sha1: "abc".into(),
        cluster: "prod2".into(),
    };
    h.store
        .apply(&release.into_resource("app1-prod2").unwrap())
        .unwrap();
    settle().await;

    assert_eq!(h.count(Kind::Install), 0);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_install_phase_stops_the_gateway() {
    let mut h = Harness::new();
    h.start(RecoveryPolicy::default());

    let mut install = InstallSpec {
        project: "myproj".into(),
        app: "app1".into(),
        sha1: "abc".into(),
        cluster: "prod1".into(),
        phase: InstallPhase::Pending,
        started_at: None,
    }
    .into_resource("app1-prod1-abc")
    .unwrap();
    install.spec.insert("phase".into(), "exploded".into());
    h.store.apply(&install).unwrap();

    let result = h.finished().await;
    assert!(matches!(result, Err(GatewayError::Invariant(_))));
}

#[tokio::test]
async fn installs_for_other_clusters_are_not_inspected() {
    let mut h = Harness::new();
    h.start(RecoveryPolicy::default());

    let mut install = InstallSpec {
        project: "myproj".into(),
        app: "app1".into(),
        sha1: "abc".into(),
        cluster: "prod2".into(),
        phase: InstallPhase::Pending,
        started_at: None,
    }
    .into_resource("app1-prod2-abc")
    .unwrap();
    install.spec.insert("phase".into(), "retrying".into());
    h.store.apply(&install).unwrap();
    settle().await;

    assert!(h.still_running());
    h.deploy("app1", "myproj", "abc");
    h.wait_for_phase("app1-prod1-abc", "completed").await;
    h.stop().await.unwrap();
}

#[tokio::test]
async fn deployment_without_app_stops_the_gateway() {
    let mut h = Harness::new();
    h.start(RecoveryPolicy::default());

    let mut spec = Map::new();
    spec.insert("project".into(), "myproj".into());
    h.store
        .apply(&Resource::new(Kind::Deployment, "app1", spec))
        .unwrap();

    let result = h.finished().await;
    assert!(matches!(result, Err(GatewayError::Invariant(_))));
    assert_eq!(h.count(Kind::Release), 0);
}

#[tokio::test]
async fn broken_watch_stops_the_gateway_by_default() {
    let backend = Arc::new(FlakyStreamBackend::new());
    let mut h = Harness::over(backend.clone());
    h.start(RecoveryPolicy::default());
    settle().await;

    backend.break_next("-deployment");
    match h.finished().await {
        Err(GatewayError::Invariant(reason)) => {
            assert!(reason.contains("deployment watch failed"), "{reason}");
        }
        other => panic!("expected an invariant failure, got {other:?}"),
    }
}

#[tokio::test]
async fn broken_watch_is_reopened_when_enabled() {
    let backend = Arc::new(FlakyStreamBackend::new());
    let mut h = Harness::over(backend.clone());
    h.start(RecoveryPolicy {
        running_timeout: None,
        resubscribe_on_error: true,
    });
    settle().await;

    backend.break_next("-deployment");
    settle().await;
    assert!(h.still_running());

    h.deploy("app1", "myproj", "abc");
    h.wait_for_phase("app1-prod1-abc", "completed").await;
    h.stop().await.unwrap();
}

#[tokio::test]
async fn stuck_running_install_times_out_when_enabled() {
    let mut h = Harness::new();
    let stuck = InstallSpec {
        project: "myproj".into(),
        app: "app1".into(),
        sha1: "abc".into(),
        cluster: "prod1".into(),
        phase: InstallPhase::Running,
        started_at: Some(1),
    };
    h.store
        .apply(&stuck.into_resource("app1-prod1-abc").unwrap())
        .unwrap();

    h.start(RecoveryPolicy {
        running_timeout: Some(Duration::from_secs(60)),
        resubscribe_on_error: false,
    });
    h.wait_for_phase("app1-prod1-abc", "failed").await;
    assert!(h.executor.jobs().is_empty());
    h.stop().await.unwrap();
}

#[tokio::test]
async fn quiet_running_install_is_swept_after_the_timeout() {
    let mut h = Harness::new();
    h.start(RecoveryPolicy {
        running_timeout: Some(Duration::from_secs(1)),
        resubscribe_on_error: false,
    });

    let started_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let running = InstallSpec {
        project: "myproj".into(),
        app: "app1".into(),
        sha1: "abc".into(),
        cluster: "prod1".into(),
        phase: InstallPhase::Running,
        started_at: Some(started_at),
    };
    h.store
        .apply(&running.into_resource("app1-prod1-abc").unwrap())
        .unwrap();

    // No further change records arrive; only the sweep can fail it.
    h.wait_for_phase("app1-prod1-abc", "failed").await;
    assert!(h.executor.jobs().is_empty());
    h.stop().await.unwrap();
}

#[tokio::test]
async fn running_install_is_left_alone_by_default() {
    let mut h = Harness::new();
    let stuck: Resource = InstallSpec {
        project: "myproj".into(),
        app: "app1".into(),
        sha1: "abc".into(),
        cluster: "prod1".into(),
        phase: InstallPhase::Running,
        started_at: Some(1),
    }
    .into_resource("app1-prod1-abc")
    .unwrap();
    h.store.apply(&stuck).unwrap();

    h.start(RecoveryPolicy::default());
    settle().await;
    assert_eq!(h.phase("app1-prod1-abc").as_deref(), Some("running"));
    h.stop().await.unwrap();
}
