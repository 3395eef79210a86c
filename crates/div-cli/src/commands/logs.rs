use std::io::Write;
use std::time::Duration;

use anyhow::{Context as _, bail};
use tokio::sync::watch;

use super::{Context, parse_kind};

/// Print the log lines of one resource, optionally only the recent ones,
/// and keep printing new lines while following.
pub async fn logs(
    ctx: &Context,
    resource: &str,
    name: &str,
    since: Option<&str>,
    follow: bool,
    shutdown: watch::Receiver<bool>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let kind = parse_kind(resource)?;
    let since = since.map(parse_since).transpose()?;
    let mut tail = ctx.logs.read(kind, name, since, follow, shutdown)?;

    loop {
        tokio::select! {
            message = tail.messages.recv() => match message {
                Some(line) => {
                    writeln!(out, "{line}")?;
                    out.flush()?;
                }
                None => break,
            },
            Some(err) = tail.errors.recv() => {
                return Err(anyhow::Error::new(err).context("failed to read logs"));
            }
        }
    }
    if let Ok(err) = tail.errors.try_recv() {
        return Err(anyhow::Error::new(err).context("failed to read logs"));
    }
    Ok(())
}

/// `90s`, `10m`, `2h`, `1d`; a bare number is seconds.
fn parse_since(value: &str) -> anyhow::Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration \"{value}\""))?;
    let unit_secs: u64 = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        other => bail!("invalid duration unit \"{other}\" in \"{value}\""),
    };
    let Some(secs) = amount.checked_mul(unit_secs) else {
        bail!("duration \"{value}\" is too large");
    };
    Ok(Duration::from_secs(secs))
}
