//! Gateway controller: drives the deployment → release → install cascade.
//!
//! The controller watches deployments, releases and installs and reacts to
//! one event at a time. Every rule checks the current stored state of the
//! resource it would create, so replayed or duplicated events are no-ops.
//!
//! Install phases:
//!
//! ```text
//! pending ──► running ──► completed
//!                    └──► failed
//! ```
//!
//! Each transition is applied separately, so a crash during a job leaves
//! the install visibly `running`.

use std::io::{self, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use div_core::{
    DeploymentSpec, InstallPhase, InstallSpec, InstallTarget, Kind, KindSpec, ReleaseSpec,
    Resource, merge_spec,
};
use div_state::{LogStore, ResourceStore, StateError, Watch};

use crate::error::{GatewayError, GatewayResult};
use crate::executor::{Executor, JobSubmission, Tee};
use crate::policy::RecoveryPolicy;
use crate::targets::Targets;

/// Reconciles one cluster's share of a namespace.
///
/// At most one controller may run per (project, cluster) pair: nothing
/// guards two controllers against racing on the same installs.
pub struct Controller<E> {
    store: ResourceStore,
    logs: LogStore,
    targets: Targets,
    executor: E,
    policy: RecoveryPolicy,
    script: String,
}

impl<E: Executor> Controller<E> {
    pub fn new(store: ResourceStore, logs: LogStore, targets: Targets, executor: E) -> Self {
        Self {
            store,
            logs,
            targets,
            executor,
            policy: RecoveryPolicy::default(),
            script: div_core::config::GatewayConfig::default().script,
        }
    }

    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Script submitted with every install job.
    pub fn with_script(mut self, script: &str) -> Self {
        self.script = script.to_string();
        self
    }

    /// Run until `shutdown` turns true or an invariant is violated.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> GatewayResult<()> {
        let mut deployments = self.open_watch(Kind::Deployment, &shutdown)?;
        let mut releases = self.open_watch(Kind::Release, &shutdown)?;
        let mut installs = self.open_watch(Kind::Install, &shutdown)?;
        // Installs this controller created, delivered without waiting for
        // the change feed to echo them.
        let (feedback_tx, mut feedback) = mpsc::channel::<Resource>(1);
        // Stuck installs may never produce another change record.
        let sweep_every = self.policy.sweep_interval();
        let mut sweep =
            tokio::time::interval(sweep_every.unwrap_or(Duration::from_secs(3600)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            cluster = %self.targets.cluster(),
            namespace = %self.store.namespace(),
            projects = self.targets.projects().len(),
            apps = self.targets.apps().len(),
            "gateway started"
        );

        loop {
            if *shutdown.borrow() {
                info!(cluster = %self.targets.cluster(), "gateway shutting down");
                return Ok(());
            }
            tokio::select! {
                biased;

                Some(install) = feedback.recv() => {
                    self.on_install(&install).await?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(cluster = %self.targets.cluster(), "gateway shutting down");
                        return Ok(());
                    }
                }
                deployment = deployments.resources.recv() => match deployment {
                    Some(d) => self.on_deployment(&d)?,
                    None => deployments = self.reopen(Kind::Deployment, None, &shutdown)?,
                },
                release = releases.resources.recv() => match release {
                    Some(r) => self.on_release(&r, &feedback_tx)?,
                    None => releases = self.reopen(Kind::Release, None, &shutdown)?,
                },
                install = installs.resources.recv() => match install {
                    Some(i) => self.on_install(&i).await?,
                    None => installs = self.reopen(Kind::Install, None, &shutdown)?,
                },
                Some(e) = deployments.errors.recv() => {
                    deployments = self.reopen(Kind::Deployment, Some(e), &shutdown)?;
                }
                Some(e) = releases.errors.recv() => {
                    releases = self.reopen(Kind::Release, Some(e), &shutdown)?;
                }
                Some(e) = installs.errors.recv() => {
                    installs = self.reopen(Kind::Install, Some(e), &shutdown)?;
                }
                _ = sweep.tick(), if sweep_every.is_some() => {
                    self.sweep_running()?;
                }
            }
        }
    }

    fn open_watch(&self, kind: Kind, shutdown: &watch::Receiver<bool>) -> GatewayResult<Watch> {
        Ok(self.store.watch(kind, None, Vec::new(), shutdown.clone())?)
    }

    /// A watch stream failed or closed. Reopen it if the policy allows,
    /// otherwise stop. During shutdown the stream is replaced by a closed
    /// one and the loop ends on its next turn.
    fn reopen(
        &self,
        kind: Kind,
        cause: Option<StateError>,
        shutdown: &watch::Receiver<bool>,
    ) -> GatewayResult<Watch> {
        let reason = match &cause {
            Some(e) => e.to_string(),
            None => "stream closed".to_string(),
        };
        if *shutdown.borrow() {
            debug!(%kind, "watch closed during shutdown");
            return Ok(closed_watch());
        }
        if !self.policy.resubscribe_on_error {
            error!(%kind, %reason, "watch failed");
            return Err(GatewayError::Invariant(format!("{kind} watch failed: {reason}")));
        }
        warn!(%kind, %reason, "watch failed, resubscribing");
        self.open_watch(kind, shutdown)
    }

    // ── Cascade rules ──────────────────────────────────────────────

    /// Deployment → Release `<deployment>-<cluster>`, applied when missing
    /// or when its sha1 differs.
    fn on_deployment(&self, deployment: &Resource) -> GatewayResult<()> {
        let spec = DeploymentSpec::decode(deployment).map_err(GatewayError::corrupt)?;
        if !self.targets.includes(&spec.project, &spec.app) {
            debug!(deployment = %deployment.name_hash_key, "deployment not targeted");
            return Ok(());
        }

        let cluster = self.targets.cluster();
        let release_name = ReleaseSpec::release_name(&deployment.name_hash_key, cluster);
        if let Some(existing) = self.store.get_optional(Kind::Release, &release_name)? {
            if existing.spec_str("sha1").unwrap_or_default() == spec.sha1 {
                debug!(release = %release_name, sha1 = %spec.sha1, "release up to date");
                return Ok(());
            }
        }

        let release = ReleaseSpec {
            project: spec.project,
            app: spec.app,
            sha1: spec.sha1,
            cluster: cluster.to_string(),
        };
        self.store.apply(&release.into_resource(&release_name)?)?;
        info!(
            deployment = %deployment.name_hash_key,
            release = %release_name,
            sha1 = %release.sha1,
            "release applied"
        );
        Ok(())
    }

    /// Release → Install `<release>-<sha1>`, created once as `pending`.
    fn on_release(&self, release: &Resource, feedback: &mpsc::Sender<Resource>) -> GatewayResult<()> {
        let spec = ReleaseSpec::decode(release).map_err(GatewayError::corrupt)?;
        if !self
            .targets
            .includes_on_cluster(&spec.project, &spec.app, &spec.cluster)
        {
            debug!(release = %release.name_hash_key, "release not targeted");
            return Ok(());
        }

        let install_name = InstallSpec::install_name(&release.name_hash_key, &spec.sha1);
        if let Some(existing) = self.store.get_optional(Kind::Install, &install_name)? {
            info!(
                install = %install_name,
                phase = existing.spec_str("phase").unwrap_or("unknown"),
                "install already triggered, skipping"
            );
            return Ok(());
        }

        let install = InstallSpec {
            project: spec.project,
            app: spec.app,
            sha1: spec.sha1,
            cluster: spec.cluster,
            phase: InstallPhase::Pending,
            started_at: None,
        }
        .into_resource(&install_name)?;
        self.store.apply(&install)?;
        info!(release = %release.name_hash_key, install = %install_name, "install created");

        if let Err(mpsc::error::TrySendError::Full(_)) = feedback.try_send(install) {
            debug!(install = %install_name, "feedback full, waiting for the change feed");
        }
        Ok(())
    }

    /// Install: run it when `pending`, otherwise report its state.
    async fn on_install(&self, install: &Resource) -> GatewayResult<()> {
        // Only a targeted install has its phase checked.
        let target = InstallTarget::decode(install).map_err(GatewayError::corrupt)?;
        if !self
            .targets
            .includes_on_cluster(&target.project, &target.app, &target.cluster)
        {
            debug!(install = %install.name_hash_key, "install not targeted");
            return Ok(());
        }

        let spec = InstallSpec::decode(install).map_err(GatewayError::corrupt)?;
        let name = &install.name_hash_key;
        match spec.phase {
            InstallPhase::Pending => self.run_install(name).await,
            InstallPhase::Running => {
                if self.policy.timed_out(spec.started_at, now_secs()) {
                    self.fail_timed_out(name)
                } else {
                    warn!(
                        install = %name,
                        "install is already running; remove it and redeploy to rerun"
                    );
                    Ok(())
                }
            }
            InstallPhase::Failed => {
                warn!(install = %name, "install failed; not retrying");
                Ok(())
            }
            InstallPhase::Completed => {
                info!(install = %name, "install already completed, skipping");
                Ok(())
            }
        }
    }

    async fn run_install(&self, name: &str) -> GatewayResult<()> {
        // The feedback channel and the change feed both deliver a new
        // install; only the first to see it stored as pending runs it.
        let Some(mut resource) = self.store.get_optional(Kind::Install, name)? else {
            warn!(install = %name, "pending install no longer exists");
            return Ok(());
        };
        let mut spec = InstallSpec::decode(&resource).map_err(GatewayError::corrupt)?;
        if spec.phase != InstallPhase::Pending {
            debug!(install = %name, phase = %spec.phase, "stale pending event, skipping");
            return Ok(());
        }

        let job = JobSubmission::for_install(self.store.namespace(), &spec, &self.script);
        let log_sink = self.logs.writer(Kind::Install, name)?;
        let mut sink = Tee::new(log_sink, io::stderr());

        spec.phase = InstallPhase::Running;
        spec.started_at = Some(now_secs());
        merge_spec(&mut resource, &spec)?;
        self.store.apply(&resource)?;
        info!(install = %name, commit = %job.commit, "install running");

        let outcome = self.executor.submit(&job, &mut sink).await;
        spec.phase = match outcome {
            Ok(()) => InstallPhase::Completed,
            Err(e) => {
                error!(install = %name, error = %e, "job failed");
                if let Err(write_err) = writeln!(sink, "job failed: {e}") {
                    warn!(install = %name, error = %write_err, "failed to record job failure in logs");
                }
                InstallPhase::Failed
            }
        };
        if let Err(e) = sink.flush() {
            warn!(install = %name, error = %e, "failed to flush install logs");
        }

        merge_spec(&mut resource, &spec)?;
        self.store.apply(&resource)?;
        info!(install = %name, phase = %spec.phase, "install finished");
        Ok(())
    }

    /// Fail every targeted install that has been `running` too long.
    fn sweep_running(&self) -> GatewayResult<()> {
        let installs = match self.store.get(Kind::Install, None, &[]) {
            Ok(found) => found,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for install in installs {
            let target = InstallTarget::decode(&install).map_err(GatewayError::corrupt)?;
            if !self
                .targets
                .includes_on_cluster(&target.project, &target.app, &target.cluster)
            {
                continue;
            }
            let spec = InstallSpec::decode(&install).map_err(GatewayError::corrupt)?;
            if spec.phase == InstallPhase::Running
                && self.policy.timed_out(spec.started_at, now_secs())
            {
                self.fail_timed_out(&install.name_hash_key)?;
            }
        }
        Ok(())
    }

    /// Mark a stuck install failed, if it is still stored as running.
    fn fail_timed_out(&self, name: &str) -> GatewayResult<()> {
        let Some(mut resource) = self.store.get_optional(Kind::Install, name)? else {
            return Ok(());
        };
        let mut spec = InstallSpec::decode(&resource).map_err(GatewayError::corrupt)?;
        if spec.phase != InstallPhase::Running || !self.policy.timed_out(spec.started_at, now_secs()) {
            return Ok(());
        }
        spec.phase = InstallPhase::Failed;
        merge_spec(&mut resource, &spec)?;
        self.store.apply(&resource)?;
        warn!(
            install = %name,
            started_at = spec.started_at.unwrap_or_default(),
            "install timed out while running, marked failed"
        );
        Ok(())
    }
}

fn closed_watch() -> Watch {
    Watch {
        resources: mpsc::channel(1).1,
        errors: mpsc::channel(1).1,
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
