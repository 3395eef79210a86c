use std::io::Write;

use super::{Context, parse_kind};

pub fn delete(
    ctx: &Context,
    resource: &str,
    name: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let kind = parse_kind(resource)?;
    ctx.store.delete(kind, name)?;
    writeln!(out, "{kind} \"{name}\" deleted")?;
    Ok(())
}
