//! Printing command results to stdout as plain tables, JSON or YAML.

use std::io::{self, Write};

use serde::Serialize;

use crate::app::{OutputView, PlannedJob, RunSummary};
use crate::errors::Result;
use crate::storage::documents::{CredentialSet, Installation, ParameterSet};
use crate::types::OutputFormat;
use crate::workflow::Workflow;

/// Print `value` in `format`; `plain` renders the human-readable form.
pub fn print<T, F>(format: OutputFormat, value: &T, plain: F) -> Result<()>
where
    T: Serialize + ?Sized,
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write(&mut out, format, value, plain)
}

pub fn write<T, F>(out: &mut dyn Write, format: OutputFormat, value: &T, plain: F) -> Result<()>
where
    T: Serialize + ?Sized,
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    match format {
        OutputFormat::Plain => plain(out)?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, value)?;
            writeln!(out)?;
        }
        OutputFormat::Yaml => out.write_all(serde_yaml::to_string(value)?.as_bytes())?,
    }
    out.flush()?;
    Ok(())
}

/// Left-aligned columns sized to their widest cell.
pub fn table(out: &mut dyn Write, headers: &[&str], rows: &[Vec<String>]) -> io::Result<()> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }
    let line = |cells: Vec<&str>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:<width$}", width = *w))
            .collect::<Vec<_>>()
            .join("   ")
            .trim_end()
            .to_string()
    };
    writeln!(out, "{}", line(headers.to_vec()))?;
    for row in rows {
        writeln!(out, "{}", line(row.iter().map(String::as_str).collect()))?;
    }
    Ok(())
}

fn or_dash(s: &str) -> String {
    if s.is_empty() { "-".to_string() } else { s.to_string() }
}

pub fn installations(out: &mut dyn Write, items: &[Installation]) -> io::Result<()> {
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|i| {
            vec![
                or_dash(i.namespace()),
                i.name().to_string(),
                or_dash(&i.status.bundle_version),
                or_dash(&i.status.last_action),
                i.status
                    .last_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                i.status
                    .modified
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    table(
        out,
        &["NAMESPACE", "NAME", "VERSION", "LAST ACTION", "STATUS", "MODIFIED"],
        &rows,
    )
}

pub fn installation(out: &mut dyn Write, inst: &Installation) -> io::Result<()> {
    writeln!(out, "Name:          {}", inst.name())?;
    writeln!(out, "Namespace:     {}", or_dash(inst.namespace()))?;
    writeln!(out, "Bundle:        {}", or_dash(&inst.status.bundle_reference))?;
    writeln!(out, "Version:       {}", or_dash(&inst.status.bundle_version))?;
    if let Some(d) = &inst.status.bundle_digest {
        writeln!(out, "Digest:        {d}")?;
    }
    writeln!(out, "Installed:     {}", inst.is_installed())?;
    writeln!(out, "Last action:   {}", or_dash(&inst.status.last_action))?;
    if let Some(s) = inst.status.last_status {
        writeln!(out, "Last status:   {s}")?;
    }
    if !inst.spec.parameter_sets.is_empty() {
        writeln!(out, "Parameter sets:  {}", inst.spec.parameter_sets.join(", "))?;
    }
    if !inst.spec.credential_sets.is_empty() {
        writeln!(out, "Credential sets: {}", inst.spec.credential_sets.join(", "))?;
    }
    for (k, v) in &inst.spec.labels {
        writeln!(out, "Label:         {k}={v}")?;
    }
    Ok(())
}

pub fn runs(out: &mut dyn Write, items: &[RunSummary]) -> io::Result<()> {
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|r| {
            vec![
                r.id.clone(),
                r.action.clone(),
                r.status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                r.created.format("%Y-%m-%d %H:%M:%S").to_string(),
                or_dash(&r.message),
            ]
        })
        .collect();
    table(out, &["RUN", "ACTION", "STATUS", "CREATED", "MESSAGE"], &rows)
}

pub fn outputs(out: &mut dyn Write, items: &[OutputView]) -> io::Result<()> {
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|o| {
            vec![
                o.name.clone(),
                o.value.replace('\n', "\\n"),
                o.source.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    table(out, &["NAME", "VALUE", "FROM"], &rows)
}

pub fn workflow(out: &mut dyn Write, wf: &Workflow) -> io::Result<()> {
    writeln!(out, "Workflow:      {}", wf.id)?;
    writeln!(out, "Installation:  {}", wf.installation)?;
    writeln!(
        out,
        "Status:        {}",
        wf.status
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "pending".to_string())
    )?;
    if !wf.status.message.is_empty() {
        writeln!(out, "Message:       {}", wf.status.message)?;
    }
    if wf.status.cancel_requested {
        writeln!(out, "Cancel requested")?;
    }
    let rows: Vec<Vec<String>> = wf
        .jobs()
        .map(|j| {
            vec![
                j.key.clone(),
                j.installation.name.clone(),
                j.action.clone(),
                j.status
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "pending".to_string()),
                or_dash(&j.depends.join(",")),
            ]
        })
        .collect();
    writeln!(out)?;
    table(out, &["JOB", "INSTALLATION", "ACTION", "STATUS", "DEPENDS"], &rows)
}

pub fn workflows(out: &mut dyn Write, items: &[Workflow]) -> io::Result<()> {
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|w| {
            vec![
                w.id.clone(),
                or_dash(&w.namespace),
                w.installation.clone(),
                w.status
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "pending".to_string()),
                w.jobs().count().to_string(),
            ]
        })
        .collect();
    table(out, &["WORKFLOW", "NAMESPACE", "INSTALLATION", "STATUS", "JOBS"], &rows)
}

pub fn plan(out: &mut dyn Write, jobs: &[PlannedJob]) -> io::Result<()> {
    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|j| {
            vec![
                j.key.clone(),
                j.installation.clone(),
                if j.in_sync { "-".to_string() } else { j.action.clone() },
                j.reason.clone(),
            ]
        })
        .collect();
    table(out, &["JOB", "INSTALLATION", "ACTION", "REASON"], &rows)
}

pub fn parameter_sets(out: &mut dyn Write, items: &[ParameterSet]) -> io::Result<()> {
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|s| vec![or_dash(&s.namespace), s.name.clone(), s.parameters.len().to_string()])
        .collect();
    table(out, &["NAMESPACE", "NAME", "PARAMETERS"], &rows)
}

pub fn credential_sets(out: &mut dyn Write, items: &[CredentialSet]) -> io::Result<()> {
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|s| vec![or_dash(&s.namespace), s.name.clone(), s.credentials.len().to_string()])
        .collect();
    table(out, &["NAMESPACE", "NAME", "CREDENTIALS"], &rows)
}

/// Entries of a set, showing where each value comes from but never a
/// literal value.
pub fn strategies(out: &mut dyn Write, items: &[crate::secrets::SecretStrategy]) -> io::Result<()> {
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|s| vec![s.name.clone(), s.source.to_string()])
        .collect();
    table(out, &["NAME", "SOURCE"], &rows)
}
