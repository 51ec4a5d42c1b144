//! PDF primitives used by the splitter: page count, range extraction,
//! single-page extraction and merge.
//!
//! The splitter talks to a [`PdfToolkit`] rather than to pdfium directly so
//! its fallback ladder can be exercised with in-memory fakes that fail on
//! demand. [`PdfiumToolkit`] is the production implementation.
//!
//! All methods are blocking. Callers in async code go through
//! [`crate::split::split_pdf`], which moves the work onto `spawn_blocking`.

use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// A PDF primitive failed. Carries a human-readable description only; the
/// splitter decides whether the failure is fatal.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ToolkitError(pub String);

impl ToolkitError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Page-level PDF operations. Page numbers are 1-indexed and inclusive.
pub trait PdfToolkit: Send + Sync {
    /// Number of pages in `pdf`.
    fn page_count(&self, pdf: &Path) -> Result<usize, ToolkitError>;

    /// Write pages `first..=last` of `pdf` into `out_dir`, as one or more
    /// PDF files.
    fn extract_range(
        &self,
        pdf: &Path,
        first: usize,
        last: usize,
        out_dir: &Path,
    ) -> Result<(), ToolkitError>;

    /// Write a single page of `pdf` to `out_file`.
    fn extract_page(&self, pdf: &Path, page: usize, out_file: &Path) -> Result<(), ToolkitError>;

    /// Concatenate `inputs`, in order, into `out_file`.
    fn merge(&self, inputs: &[PathBuf], out_file: &Path) -> Result<(), ToolkitError>;
}

// ── pdfium implementation ────────────────────────────────────────────────

/// [`PdfToolkit`] backed by pdfium.
///
/// Binds to the library at `PDFIUM_LIB_PATH` when set, otherwise to the
/// system library. A fresh binding is made per call so the toolkit can be
/// shared across blocking threads.
#[derive(Debug, Clone, Default)]
pub struct PdfiumToolkit {
    library_path: Option<PathBuf>,
}

impl PdfiumToolkit {
    pub fn new() -> Self {
        Self {
            library_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    /// Use the pdfium library at an explicit path.
    pub fn with_library(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, ToolkitError> {
        let bindings = match &self.library_path {
            Some(path) => Pdfium::bind_to_library(path).map_err(|e| {
                ToolkitError(format!(
                    "failed to bind pdfium at '{}': {e:?}",
                    path.display()
                ))
            })?,
            None => Pdfium::bind_to_system_library().map_err(|e| {
                ToolkitError(format!(
                    "failed to bind system pdfium (set PDFIUM_LIB_PATH): {e:?}"
                ))
            })?,
        };
        Ok(Pdfium::new(bindings))
    }
}

fn open<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, ToolkitError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| ToolkitError(format!("cannot open '{}': {e:?}", path.display())))
}

fn save(doc: &PdfDocument<'_>, path: &Path) -> Result<(), ToolkitError> {
    doc.save_to_file(path)
        .map_err(|e| ToolkitError(format!("cannot write '{}': {e:?}", path.display())))
}

fn page_index(page: usize, total: usize) -> Result<PdfPageIndex, ToolkitError> {
    if page == 0 || page > total {
        return Err(ToolkitError(format!(
            "page {page} out of range (document has {total} pages)"
        )));
    }
    PdfPageIndex::try_from(page - 1)
        .map_err(|_| ToolkitError(format!("page {page} exceeds pdfium's page index range")))
}

impl PdfToolkit for PdfiumToolkit {
    fn page_count(&self, pdf: &Path) -> Result<usize, ToolkitError> {
        let pdfium = self.bind()?;
        let doc = open(&pdfium, pdf)?;
        Ok(doc.pages().len() as usize)
    }

    fn extract_range(
        &self,
        pdf: &Path,
        first: usize,
        last: usize,
        out_dir: &Path,
    ) -> Result<(), ToolkitError> {
        if first > last {
            return Err(ToolkitError(format!("empty page range {first}-{last}")));
        }
        let pdfium = self.bind()?;
        let source = open(&pdfium, pdf)?;
        let total = source.pages().len() as usize;
        let start = page_index(first, total)?;
        let end = page_index(last, total)?;

        let mut target = pdfium
            .create_new_pdf()
            .map_err(|e| ToolkitError(format!("cannot create document: {e:?}")))?;
        target
            .pages_mut()
            .copy_page_range_from_document(&source, start..=end, 0)
            .map_err(|e| ToolkitError(format!("cannot copy pages {first}-{last}: {e:?}")))?;

        let out = out_dir.join(format!("pages_{first:04}-{last:04}.pdf"));
        save(&target, &out)?;
        debug!("Extracted pages {first}-{last} → {}", out.display());
        Ok(())
    }

    fn extract_page(&self, pdf: &Path, page: usize, out_file: &Path) -> Result<(), ToolkitError> {
        let pdfium = self.bind()?;
        let source = open(&pdfium, pdf)?;
        let total = source.pages().len() as usize;
        let index = page_index(page, total)?;

        let mut target = pdfium
            .create_new_pdf()
            .map_err(|e| ToolkitError(format!("cannot create document: {e:?}")))?;
        target
            .pages_mut()
            .copy_page_range_from_document(&source, index..=index, 0)
            .map_err(|e| ToolkitError(format!("cannot copy page {page}: {e:?}")))?;
        save(&target, out_file)
    }

    fn merge(&self, inputs: &[PathBuf], out_file: &Path) -> Result<(), ToolkitError> {
        if inputs.is_empty() {
            return Err(ToolkitError::new("nothing to merge"));
        }
        let pdfium = self.bind()?;
        let mut target = pdfium
            .create_new_pdf()
            .map_err(|e| ToolkitError(format!("cannot create document: {e:?}")))?;
        for input in inputs {
            let part = open(&pdfium, input)?;
            target
                .pages_mut()
                .append(&part)
                .map_err(|e| ToolkitError(format!("cannot append '{}': {e:?}", input.display())))?;
        }
        save(&target, out_file)?;
        debug!("Merged {} files → {}", inputs.len(), out_file.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_index_is_one_based() {
        assert_eq!(page_index(1, 3).unwrap(), 0);
        assert_eq!(page_index(3, 3).unwrap(), 2);
        assert!(page_index(0, 3).is_err());
        assert!(page_index(4, 3).is_err());
    }

    #[test]
    fn explicit_library_path_wins() {
        let t = PdfiumToolkit::with_library("/opt/pdfium/libpdfium.so");
        assert_eq!(
            t.library_path.as_deref(),
            Some(Path::new("/opt/pdfium/libpdfium.so"))
        );
    }
}
