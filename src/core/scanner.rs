use crate::core::exif::MetadataProvider;
use crate::core::record::ImageRecord;
use crate::error::PipelineError;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Folder names the pipeline itself fills with finished work.
pub const SUCCESS_FOLDER: &str = "success";
pub const DUPLICATES_FOLDER: &str = "duplicates";

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub recursive: bool,
    pub excluded_folders: HashSet<String>,
    pub supported_formats: HashSet<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            excluded_folders: [SUCCESS_FOLDER, DUPLICATES_FOLDER]
                .into_iter()
                .map(String::from)
                .collect(),
            supported_formats: ["jpg", "jpeg", "png", "tif", "tiff"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl ScanOptions {
    /// Re-include previously completed subtrees.
    pub fn full_rerun(mut self) -> Self {
        self.excluded_folders.clear();
        self
    }

    pub fn non_recursive(mut self) -> Self {
        self.recursive = false;
        self
    }
}

/// Turns a directory into time-ordered image records.
pub struct ImageIndexer<'a> {
    provider: &'a dyn MetadataProvider,
    options: ScanOptions,
}

impl<'a> ImageIndexer<'a> {
    pub fn new(provider: &'a dyn MetadataProvider, options: ScanOptions) -> Self {
        Self { provider, options }
    }

    /// Index `root`. Only failing to read `root` itself is an error; images
    /// without usable metadata come back as `missing-metadata` records,
    /// sorted after every geotagged one.
    pub fn index(&self, root: &Path) -> Result<Vec<ImageRecord>, PipelineError> {
        if !root.is_dir() {
            return Err(PipelineError::InvalidPath {
                path: format!("{} is not a directory", root.to_string_lossy()),
            });
        }
        fs::read_dir(root)?;

        let files = self.discover_files(root);
        log::info!("Discovered {} image(s) under {}", files.len(), root.display());

        let mut records: Vec<ImageRecord> = files
            .into_par_iter()
            .map(|path| match self.provider.read_geotag(&path) {
                Ok(tag) => ImageRecord::tagged(path, tag),
                Err(e) => {
                    log::warn!("Excluding {}: {}", path.display(), e);
                    ImageRecord::missing_metadata(path)
                }
            })
            .collect();

        records.sort_by(|a, b| {
            (a.captured_at().is_none(), a.captured_at(), &a.path).cmp(&(
                b.captured_at().is_none(),
                b.captured_at(),
                &b.path,
            ))
        });
        Ok(records)
    }

    fn discover_files(&self, root: &Path) -> Vec<PathBuf> {
        let max_depth = if self.options.recursive { usize::MAX } else { 1 };
        let mut discovered_files = Vec::new();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|e| !self.is_excluded_dir(e))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let supported = path
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
                .is_some_and(|ext| self.options.supported_formats.contains(&ext));

            if supported {
                discovered_files.push(path.to_path_buf());
            } else {
                log::info!("Ignoring {}", path.display());
            }
        }

        discovered_files
    }

    fn is_excluded_dir(&self, entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && self
                .options
                .excluded_folders
                .contains(entry.file_name().to_string_lossy().as_ref())
    }
}
