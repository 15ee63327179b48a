//! Rendered page images of uploaded documents.
//!
//! Rasterizing PDFs happens outside this crate. A document is expected as a
//! directory of `page-{n}.png` (or `.jpg`/`.jpeg`) files, numbered from 1.

use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Image format of a rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }
}

/// One rendered page.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub page: usize,
    pub format: ImageFormat,
    pub bytes: Vec<u8>,
}

/// Source of page counts and page images.
pub trait PageSource: Send + Sync {
    fn page_count(&self, document: &str) -> Result<usize>;

    /// Render one page, numbered from 1.
    fn render(&self, document: &str, page: usize) -> Result<PageImage>;
}

/// Pre-rendered pages under `{root}/{document key}/`.
pub struct DirPageSource {
    root: PathBuf,
}

impl DirPageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn document_dir(&self, document: &str) -> Result<PathBuf> {
        let relative = Path::new(document);
        if document.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid document key: {}", document);
        }
        let dir = self.root.join(relative);
        if !dir.is_dir() {
            bail!("No rendered pages for {}", document);
        }
        Ok(dir)
    }
}

fn page_number(path: &Path) -> Option<usize> {
    let ext = path.extension()?.to_str()?;
    ImageFormat::from_extension(ext)?;
    path.file_stem()?
        .to_str()?
        .strip_prefix("page-")?
        .parse()
        .ok()
        .filter(|n| *n > 0)
}

impl PageSource for DirPageSource {
    fn page_count(&self, document: &str) -> Result<usize> {
        let dir = self.document_dir(document)?;
        let pages: BTreeSet<usize> = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| page_number(e.path()))
            .collect();
        Ok(pages.len())
    }

    fn render(&self, document: &str, page: usize) -> Result<PageImage> {
        let dir = self.document_dir(document)?;
        for ext in EXTENSIONS {
            let path = dir.join(format!("page-{}.{}", page, ext));
            if !path.is_file() {
                continue;
            }
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let format = ImageFormat::from_extension(ext).unwrap_or(ImageFormat::Png);
            return Ok(PageImage {
                page,
                format,
                bytes,
            });
        }
        bail!("Page {} of {} not found", page, document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn document(pages: &[&str]) -> (TempDir, DirPageSource) {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("uploads/job-1/app.pdf");
        std::fs::create_dir_all(&dir).unwrap();
        for name in pages {
            std::fs::write(dir.join(name), name.as_bytes()).unwrap();
        }
        let source = DirPageSource::new(root.path());
        (root, source)
    }

    #[test]
    fn test_page_count_ignores_other_files() {
        let (_root, source) = document(&["page-1.png", "page-2.jpg", "notes.txt", "page-x.png"]);
        assert_eq!(source.page_count("uploads/job-1/app.pdf").unwrap(), 2);
    }

    #[test]
    fn test_render_reads_bytes() {
        let (_root, source) = document(&["page-1.png", "page-2.jpeg"]);
        let page = source.render("uploads/job-1/app.pdf", 2).unwrap();
        assert_eq!(page.format, ImageFormat::Jpeg);
        assert_eq!(page.bytes, b"page-2.jpeg");
        assert!(source.render("uploads/job-1/app.pdf", 3).is_err());
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let (_root, source) = document(&["page-1.png"]);
        assert!(source.page_count("../etc").is_err());
        assert!(source.page_count("/abs").is_err());
        assert!(source.page_count("uploads/missing.pdf").is_err());
    }
}
