//! Per-student PDF splitting.
//!
//! A class set arrives as one scanned PDF with every student's pages in a
//! row. Given `pages_per_student = P`, unit `i` (0-indexed) covers pages
//! `i*P+1 ..= min((i+1)*P, total)`; the last unit may be short.
//!
//! ## Fallback ladder (per unit)
//!
//! ```text
//! 1. bulk range extraction into temp_extract_<n>/
//!      one file   → copy
//!      many files → merge (by mtime), merge failure → keep the first
//! 2. page-by-page extraction into a scratch dir (bad pages skipped)
//!      zero pages → ExtractionFailed (whole split aborts)
//!      one page   → copy
//!      many pages → merge, merge failure → keep the first page (data loss, warned)
//! 3. verify: missing/empty output → EmptyOutput
//!            page-count mismatch → warning (PageCountMismatch in strict mode)
//! ```
//!
//! A split is all-or-nothing: downstream grading relies on an index-aligned
//! set of student documents, so one unit that cannot be produced fails the
//! whole call.

pub mod toolkit;

pub use toolkit::{PdfToolkit, PdfiumToolkit, ToolkitError};

use crate::error::GraderError;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One student's contiguous page range and the file holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitUnit {
    /// 0-based position in the upload.
    pub index: usize,
    pub source: PathBuf,
    /// 1-indexed, inclusive.
    pub first_page: usize,
    /// 1-indexed, inclusive.
    pub last_page: usize,
    pub output: PathBuf,
}

impl SplitUnit {
    pub fn page_count(&self) -> usize {
        self.last_page + 1 - self.first_page
    }
}

/// Result of one split invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitOutcome {
    /// Session directory owned by this invocation.
    pub session_dir: PathBuf,
    pub total_pages: usize,
    pub units: Vec<SplitUnit>,
}

impl SplitOutcome {
    /// Output paths in student order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.units.iter().map(|u| u.output.clone()).collect()
    }
}

/// Knobs for [`split_pdf`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitOptions {
    /// Fail with [`GraderError::PageCountMismatch`] instead of warning.
    pub strict_page_count: bool,
}

/// Partition `1..=total_pages` into contiguous inclusive ranges of
/// `per_unit` pages.
pub fn plan_ranges(total_pages: usize, per_unit: usize) -> Vec<(usize, usize)> {
    if per_unit == 0 {
        return Vec::new();
    }
    (1..=total_pages)
        .step_by(per_unit)
        .map(|first| (first, (first + per_unit - 1).min(total_pages)))
        .collect()
}

/// Split `source` into per-student PDFs under a fresh session directory in
/// `output_dir`. Runs the blocking algorithm on Tokio's blocking pool.
pub async fn split_pdf(
    toolkit: Arc<dyn PdfToolkit>,
    source: &Path,
    pages_per_student: usize,
    output_dir: &Path,
    options: SplitOptions,
) -> Result<SplitOutcome, GraderError> {
    let source = source.to_path_buf();
    let output_dir = output_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        split_pdf_blocking(toolkit.as_ref(), &source, pages_per_student, &output_dir, options)
    })
    .await
    .map_err(|e| GraderError::Internal(format!("Split task panicked: {}", e)))?
}

/// Blocking implementation of [`split_pdf`].
pub fn split_pdf_blocking(
    toolkit: &dyn PdfToolkit,
    source: &Path,
    pages_per_student: usize,
    output_dir: &Path,
    options: SplitOptions,
) -> Result<SplitOutcome, GraderError> {
    // ── Step 1: validate input ───────────────────────────────────────────
    if pages_per_student == 0 {
        return Err(GraderError::InvalidInput(
            "pages per student must be ≥ 1".into(),
        ));
    }
    validate_pdf_file(source)?;

    let total_pages = toolkit
        .page_count(source)
        .map_err(|e| GraderError::InvalidInput(format!("not a readable PDF: {e}")))?;
    if total_pages == 0 {
        return Err(GraderError::InvalidInput("PDF has no pages".into()));
    }

    // ── Step 2: session directory ────────────────────────────────────────
    let session_dir = output_dir.join(session_dir_name(source));
    fs::create_dir_all(&session_dir).map_err(|e| GraderError::io(&session_dir, e))?;

    let ranges = plan_ranges(total_pages, pages_per_student);
    info!(
        "Splitting {} ({} pages) into {} student documents → {}",
        source.display(),
        total_pages,
        ranges.len(),
        session_dir.display()
    );

    // ── Step 3: produce each unit ────────────────────────────────────────
    let mut units = Vec::with_capacity(ranges.len());
    for (index, (first, last)) in ranges.into_iter().enumerate() {
        let unit = SplitUnit {
            index,
            source: source.to_path_buf(),
            first_page: first,
            last_page: last,
            output: session_dir.join(format!("student_{}.pdf", index + 1)),
        };
        produce_unit(toolkit, &unit, &session_dir)?;
        verify_unit(toolkit, &unit, options)?;
        debug!(
            "Student {}: pages {}-{} → {}",
            index + 1,
            first,
            last,
            unit.output.display()
        );
        units.push(unit);
    }

    info!("Split complete: {} student documents", units.len());
    Ok(SplitOutcome {
        session_dir,
        total_pages,
        units,
    })
}

fn validate_pdf_file(path: &Path) -> Result<(), GraderError> {
    let meta = fs::metadata(path)
        .map_err(|_| GraderError::InvalidInput(format!("file not found: {}", path.display())))?;
    if !meta.is_file() {
        return Err(GraderError::InvalidInput(format!(
            "not a regular file: {}",
            path.display()
        )));
    }
    if meta.len() == 0 {
        return Err(GraderError::InvalidInput(format!(
            "file is empty: {}",
            path.display()
        )));
    }

    let mut magic = [0u8; 4];
    let mut f = fs::File::open(path).map_err(|e| {
        GraderError::InvalidInput(format!("cannot read {}: {e}", path.display()))
    })?;
    if f.read_exact(&mut magic).is_err() || &magic != b"%PDF" {
        return Err(GraderError::InvalidInput(format!(
            "not a PDF file: {} (first bytes {:?})",
            path.display(),
            magic
        )));
    }
    Ok(())
}

/// `<stem>_<YYYYMMDD_HHMMSS>_<8 hex>`; the random suffix keeps simultaneous
/// uploads of the same file apart.
fn session_dir_name(source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        stem,
        Local::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

// ── Unit production ──────────────────────────────────────────────────────

fn produce_unit(
    toolkit: &dyn PdfToolkit,
    unit: &SplitUnit,
    session_dir: &Path,
) -> Result<(), GraderError> {
    // Dropped (and removed) when this function returns, success or failure.
    let temp = tempfile::Builder::new()
        .prefix(&format!("temp_extract_{}_", unit.index + 1))
        .tempdir_in(session_dir)
        .map_err(|e| GraderError::io(session_dir, e))?;

    match toolkit.extract_range(&unit.source, unit.first_page, unit.last_page, temp.path()) {
        Ok(()) => {
            let files = pdf_files_by_mtime(temp.path())?;
            if !files.is_empty() {
                return finish_from_bulk(toolkit, unit, &files);
            }
            warn!(
                "Student {}: bulk extraction produced no files, extracting page by page",
                unit.index + 1
            );
        }
        Err(e) => {
            warn!(
                "Student {}: bulk extraction of pages {}-{} failed ({e}), extracting page by page",
                unit.index + 1,
                unit.first_page,
                unit.last_page
            );
        }
    }

    extract_page_by_page(toolkit, unit, temp.path())
}

fn finish_from_bulk(
    toolkit: &dyn PdfToolkit,
    unit: &SplitUnit,
    files: &[PathBuf],
) -> Result<(), GraderError> {
    if let [only] = files {
        return copy_file(only, &unit.output);
    }
    debug!(
        "Student {}: merging {} extracted files",
        unit.index + 1,
        files.len()
    );
    if let Err(e) = toolkit.merge(files, &unit.output) {
        warn!(
            "Student {}: merging extracted files failed ({e}); keeping the first file only",
            unit.index + 1
        );
        return copy_file(&files[0], &unit.output);
    }
    Ok(())
}

fn extract_page_by_page(
    toolkit: &dyn PdfToolkit,
    unit: &SplitUnit,
    parent: &Path,
) -> Result<(), GraderError> {
    let scratch = tempfile::Builder::new()
        .prefix("pages_")
        .tempdir_in(parent)
        .map_err(|e| GraderError::io(parent, e))?;

    let mut pages = Vec::with_capacity(unit.page_count());
    let mut last_error = None;
    for page in unit.first_page..=unit.last_page {
        let out = scratch.path().join(format!("page_{page:04}.pdf"));
        match toolkit.extract_page(&unit.source, page, &out) {
            Ok(()) => pages.push(out),
            Err(e) => {
                warn!("Student {}: skipping page {page}: {e}", unit.index + 1);
                last_error = Some(e);
            }
        }
    }

    match pages.as_slice() {
        [] => Err(GraderError::ExtractionFailed {
            unit: unit.index + 1,
            first_page: unit.first_page,
            last_page: unit.last_page,
            detail: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no pages extracted".to_string()),
        }),
        [only] => copy_file(only, &unit.output),
        [first, ..] => {
            if let Err(e) = toolkit.merge(&pages, &unit.output) {
                warn!(
                    "Student {}: merging {} pages failed ({e}); keeping page {} only, {} pages lost",
                    unit.index + 1,
                    pages.len(),
                    unit.first_page,
                    pages.len() - 1
                );
                return copy_file(first, &unit.output);
            }
            Ok(())
        }
    }
}

fn verify_unit(
    toolkit: &dyn PdfToolkit,
    unit: &SplitUnit,
    options: SplitOptions,
) -> Result<(), GraderError> {
    let size = fs::metadata(&unit.output).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(GraderError::EmptyOutput {
            path: unit.output.clone(),
        });
    }

    let expected = unit.page_count();
    match toolkit.page_count(&unit.output) {
        Ok(actual) if actual == expected => Ok(()),
        Ok(actual) if options.strict_page_count => Err(GraderError::PageCountMismatch {
            path: unit.output.clone(),
            expected,
            actual,
        }),
        Ok(actual) => {
            warn!(
                "Student {}: expected {expected} pages, document has {actual}",
                unit.index + 1
            );
            Ok(())
        }
        Err(e) => {
            warn!(
                "Student {}: could not verify page count: {e}",
                unit.index + 1
            );
            Ok(())
        }
    }
}

// ── File helpers ─────────────────────────────────────────────────────────

/// PDF files directly inside `dir`, oldest first (name breaks ties).
fn pdf_files_by_mtime(dir: &Path) -> Result<Vec<PathBuf>, GraderError> {
    let entries = fs::read_dir(dir).map_err(|e| GraderError::io(dir, e))?;
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| GraderError::io(dir, e))?;
        let path = entry.path();
        let is_pdf = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if !is_pdf || !path.is_file() {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((mtime, path));
    }
    files.sort();
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

fn copy_file(from: &Path, to: &Path) -> Result<(), GraderError> {
    fs::copy(from, to).map_err(|e| GraderError::io(to, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_pages_three_per_student() {
        assert_eq!(
            plan_ranges(10, 3),
            vec![(1, 3), (4, 6), (7, 9), (10, 10)]
        );
    }

    #[test]
    fn ranges_cover_every_page_once() {
        for total in 1..=25 {
            for per in 1..=7 {
                let ranges = plan_ranges(total, per);
                assert_eq!(ranges.len(), total.div_ceil(per));
                let mut next = 1;
                for (first, last) in &ranges {
                    assert_eq!(*first, next);
                    assert!(last >= first);
                    next = last + 1;
                }
                assert_eq!(next, total + 1);
                let (first, last) = ranges[ranges.len() - 1];
                assert_eq!(last + 1 - first, total - per * (ranges.len() - 1));
            }
        }
    }

    #[test]
    fn zero_per_unit_plans_nothing() {
        assert!(plan_ranges(10, 0).is_empty());
    }

    #[test]
    fn session_dir_name_uses_stem() {
        let name = session_dir_name(Path::new("/tmp/class 3b.pdf"));
        assert!(name.starts_with("class 3b_"), "got {name}");
        // stem + '_' + YYYYMMDD_HHMMSS + '_' + 8 hex
        assert_eq!(name.len(), "class 3b".len() + 1 + 15 + 1 + 8);
    }

    #[test]
    fn rejects_non_pdf_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.pdf");
        fs::write(&path, b"hello world").unwrap();
        assert!(matches!(
            validate_pdf_file(&path),
            Err(GraderError::InvalidInput(_))
        ));
    }

    #[test]
    fn rejects_empty_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pdf");
        fs::write(&empty, b"").unwrap();
        assert!(validate_pdf_file(&empty).is_err());
        assert!(validate_pdf_file(&dir.path().join("missing.pdf")).is_err());
    }
}
