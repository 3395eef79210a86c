//! Rendering resources for the terminal.

use clap::ValueEnum;
use serde_json::Value;

use div_core::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// A listing: a table in text mode, a pretty JSON array otherwise.
pub fn render_list(resources: &[Resource], format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(resources)?),
        OutputFormat::Text => {
            let width = resources
                .iter()
                .map(|r| r.name_hash_key.len())
                .max()
                .unwrap_or(0)
                .max("NAME".len());
            let mut out = format!("{:<width$}  SPEC", "NAME");
            for resource in resources {
                out.push('\n');
                out.push_str(&format!(
                    "{:<width$}  {}",
                    resource.name_hash_key,
                    spec_summary(resource)
                ));
            }
            Ok(out)
        }
    }
}

/// One streamed resource: a single line in either format.
pub fn render_one(resource: &Resource, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string(resource)?),
        OutputFormat::Text => Ok(format!(
            "{}  {}",
            resource.name_hash_key,
            spec_summary(resource)
        )),
    }
}

/// `key=value` pairs of the spec, space separated.
fn spec_summary(resource: &Resource) -> String {
    resource
        .spec
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{key}={s}"),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
