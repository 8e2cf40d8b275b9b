//! Crash-safe CSV output for per-layer results
//!
//! Headers are written as soon as a [`ResultWriter`] is created. Results may
//! arrive in any order; they are buffered and written sorted by layer when
//! the writer is finished or dropped, so a failing or panicking sweep still
//! leaves every completed layer on disk.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::dataset::DatasetDict;
use crate::files::save_debug_log;

/// A result that belongs to one layer
pub trait StatResult: Send {
    fn layer(&self) -> usize;
}

/// One output table: a file name, its header and how a result becomes rows
pub struct CsvTable<'a, R> {
    pub name: String,
    pub columns: Vec<String>,
    to_csv_lines: Box<dyn Fn(&R) -> Vec<Vec<String>> + 'a>,
}

impl<'a, R> CsvTable<'a, R> {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<String>,
        to_csv_lines: impl Fn(&R) -> Vec<Vec<String>> + 'a,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            to_csv_lines: Box::new(to_csv_lines),
        }
    }

    /// Table with exactly one row per result
    pub fn single_row(
        name: impl Into<String>,
        columns: Vec<String>,
        to_csv_line: impl Fn(&R) -> Vec<String> + 'a,
    ) -> Self {
        Self::new(name, columns, move |r| vec![to_csv_line(r)])
    }

    pub fn path(&self, out_dir: &Path) -> PathBuf {
        out_dir.join(format!("{}.csv", self.name))
    }
}

/// Quote a field when it contains a separator, a quote or a line break
fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Join fields into one CSV line (without the trailing newline)
pub fn csv_line<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Buffers results and writes them, sorted by layer, into one or more tables
pub struct ResultWriter<'a, R: StatResult> {
    tables: Vec<(CsvTable<'a, R>, BufWriter<File>)>,
    buffer: Vec<R>,
    flushed: bool,
}

impl<'a, R: StatResult> ResultWriter<'a, R> {
    /// Create every table file and write its header
    pub fn create(out_dir: &Path, tables: Vec<CsvTable<'a, R>>) -> Result<Self> {
        let mut opened = Vec::with_capacity(tables.len());
        for table in tables {
            let path = table.path(out_dir);
            let file = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut out = BufWriter::new(file);
            writeln!(out, "{}", csv_line(&table.columns))?;
            out.flush()?;
            opened.push((table, out));
        }
        Ok(Self {
            tables: opened,
            buffer: Vec::new(),
            flushed: false,
        })
    }

    pub fn push(&mut self, result: R) {
        debug!("Buffered result for layer {}", result.layer());
        self.buffer.push(result);
    }

    fn write_rows(&mut self) -> Result<()> {
        self.flushed = true;
        self.buffer.sort_by_key(|r| r.layer());
        for (table, out) in &mut self.tables {
            for result in &self.buffer {
                for line in (table.to_csv_lines)(result) {
                    writeln!(out, "{}", csv_line(&line))?;
                }
            }
            out.flush()?;
        }
        Ok(())
    }

    /// Write the buffered rows and hand the results back, sorted by layer
    pub fn finish(mut self) -> Result<Vec<R>> {
        self.write_rows()?;
        Ok(std::mem::take(&mut self.buffer))
    }
}

impl<R: StatResult> Drop for ResultWriter<'_, R> {
    fn drop(&mut self) {
        if self.flushed {
            return;
        }
        if let Err(e) = self.write_rows() {
            error!("Failed to flush buffered results: {e:#}");
        }
    }
}

/// Drain `results` into the given tables under `out_dir`.
///
/// Consumption stops at the first error; everything received before it is
/// written and then the error is returned. With `debug` set, `debug.log` is
/// written afterwards in either case.
pub fn write_func_to_file<R, I>(
    results: I,
    out_dir: &Path,
    tables: Vec<CsvTable<'_, R>>,
    debug: Option<&DatasetDict>,
) -> Result<Vec<R>>
where
    R: StatResult,
    I: IntoIterator<Item = Result<R>>,
{
    let mut writer = ResultWriter::create(out_dir, tables)?;

    let mut failure = None;
    for item in results {
        match item {
            Ok(result) => writer.push(result),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let written = writer.finish();
    if let Some(datasets) = debug {
        if let Err(log_err) = save_debug_log(datasets, out_dir) {
            if failure.is_none() {
                return Err(log_err);
            }
            error!("Failed to write debug.log: {log_err:#}");
        }
    }

    match failure {
        Some(e) => {
            if let Err(flush_err) = written {
                error!("Failed to flush buffered results: {flush_err:#}");
            }
            Err(e)
        }
        None => written,
    }
}
