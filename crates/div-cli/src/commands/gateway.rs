use anyhow::Context as _;
use tokio::sync::watch;
use tracing::error;

use div_gateway::{Controller, ProcessExecutor, RecoveryPolicy, Targets};

use super::Context;

/// Resolve targets and run the controller until shutdown. A controller
/// error ends the process with a failure so a supervisor restarts it.
pub async fn gateway(
    ctx: &Context,
    cluster: &str,
    project: Option<&str>,
    app: Option<&str>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let settings = &ctx.config.gateway;
    let targets = Targets::resolve(&ctx.store, cluster, project, app)
        .context("failed to resolve gateway targets")?;
    let controller = Controller::new(
        ctx.store.clone(),
        ctx.logs.clone(),
        targets,
        ProcessExecutor::new(&settings.shell),
    )
    .with_script(&settings.script)
    .with_policy(RecoveryPolicy::from_config(settings));

    if let Err(e) = controller.run(shutdown).await {
        error!(%cluster, error = %e, "gateway stopped");
        return Err(e.into());
    }
    Ok(())
}
