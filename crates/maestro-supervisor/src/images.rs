// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use base64::Engine;
use tracing::warn;

use crate::supervisor::SupervisorError;

/// Pasted images materialised as temp files for the lifetime of one turn.
///
/// The guard unlinks every file when dropped, which covers every exit path
/// of the execution — normal end, abort, timeout, and panics unwinding
/// through the kernel.
pub struct ImageScratch {
    dir: tempfile::TempDir,
    paths: Vec<PathBuf>,
}

impl ImageScratch {
    /// Decode `data:` URLs into files under a fresh scratch directory.
    ///
    /// Entries that are not data URLs are treated as paths to existing
    /// files and passed through unchanged (without taking ownership).
    pub fn materialize(data_urls: &[String]) -> Result<Self, SupervisorError> {
        let dir = tempfile::Builder::new()
            .prefix("maestro-img-")
            .tempdir()
            .map_err(SupervisorError::Io)?;
        let mut paths = Vec::with_capacity(data_urls.len());
        for (i, url) in data_urls.iter().enumerate() {
            if let Some(rest) = url.strip_prefix("data:") {
                let (meta, payload) = rest
                    .split_once(',')
                    .ok_or_else(|| SupervisorError::BadImage("data URL without comma".into()))?;
                if !meta.ends_with(";base64") {
                    return Err(SupervisorError::BadImage(format!(
                        "unsupported data URL encoding: {meta}"
                    )));
                }
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(payload.trim())
                    .map_err(|e| SupervisorError::BadImage(e.to_string()))?;
                let ext = extension_for(meta);
                let path = dir.path().join(format!("paste-{i}.{ext}"));
                std::fs::write(&path, bytes).map_err(SupervisorError::Io)?;
                paths.push(path);
            } else {
                paths.push(PathBuf::from(url));
            }
        }
        Ok(Self { dir, paths })
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    }
}

impl Drop for ImageScratch {
    fn drop(&mut self) {
        // TempDir removes the directory; files passed through by path are
        // not ours and are left alone.
        for p in &self.paths {
            if p.starts_with(self.dir.path()) && p.exists() {
                if let Err(e) = std::fs::remove_file(p) {
                    warn!(path = %p.display(), "failed to unlink scratch image: {e}");
                }
            }
        }
    }
}

fn extension_for(meta: &str) -> &'static str {
    let mime = meta.split(';').next().unwrap_or_default();
    match mime {
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "png",
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
