use std::io::Write;

use tokio::sync::watch;
use tracing::info;

use div_core::Selector;

use super::{Context, parse_kind};
use crate::output::{self, OutputFormat};

pub struct GetRequest<'a> {
    pub resource: &'a str,
    pub name: Option<&'a str>,
    pub selectors: &'a [String],
    pub watch: bool,
}

/// Print the matching resources, then stream changes when watching.
pub async fn get(
    ctx: &Context,
    request: GetRequest<'_>,
    format: OutputFormat,
    shutdown: watch::Receiver<bool>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let kind = parse_kind(request.resource)?;
    let selectors = Selector::parse_all(request.selectors)?;

    if !request.watch {
        let found = ctx.store.get(kind, request.name, &selectors)?;
        writeln!(out, "{}", output::render_list(&found, format)?)?;
        return Ok(());
    }

    let mut watch = ctx.store.watch(kind, request.name, selectors, shutdown)?;
    info!(%kind, namespace = %ctx.store.namespace(), "streaming changes");
    loop {
        tokio::select! {
            resource = watch.resources.recv() => match resource {
                Some(resource) => {
                    writeln!(out, "{}", output::render_one(&resource, format)?)?;
                    out.flush()?;
                }
                None => break,
            },
            Some(err) = watch.errors.recv() => {
                return Err(anyhow::Error::new(err).context("stream error"));
            }
        }
    }
    Ok(())
}

/// Explain that a resource type is required, listing the known ones.
pub async fn list_kinds(ctx: &Context, out: &mut impl Write) -> anyhow::Result<()> {
    let kinds = ctx.store.list_kinds().await?;
    writeln!(
        out,
        "You must specify the type of resource to get. Valid resource types include:\n"
    )?;
    for crd in kinds {
        writeln!(out, "  * {}", crd.metadata.name)?;
    }
    Ok(())
}
