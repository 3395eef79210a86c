use std::io::Write;
use std::path::Path;

use anyhow::Context as _;

use super::Context;
use crate::output::{self, OutputFormat};

pub fn apply(
    ctx: &Context,
    file: &Path,
    format: OutputFormat,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let resource = ctx
        .store
        .apply_file(file)
        .with_context(|| format!("failed to apply {}", file.display()))?;
    match format {
        OutputFormat::Json => writeln!(out, "{}", output::render_one(&resource, format)?)?,
        OutputFormat::Text => writeln!(
            out,
            "{} \"{}\" applied",
            resource.kind, resource.name_hash_key
        )?,
    }
    Ok(())
}
