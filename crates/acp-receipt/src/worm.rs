// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only WORM export sink.
//!
//! Write-once-read-many: a receipt exports to a path derived from its id,
//! and an existing file is never overwritten. The returned URI is stable and
//! resolvable back to the stored bytes for verification.

use std::path::{Path, PathBuf};

use crate::{Receipt, ReceiptError};

/// File-backed WORM sink.
#[derive(Debug, Clone)]
pub struct WormSink {
    root: PathBuf,
}

impl WormSink {
    /// Create a sink rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Export a receipt, returning its `worm:` URI.
    ///
    /// # Errors
    ///
    /// - [`ReceiptError::WormConflict`] if the receipt was already exported.
    /// - [`ReceiptError::Storage`] on I/O failure.
    pub fn export(&self, receipt: &Receipt) -> Result<String, ReceiptError> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| ReceiptError::Storage(format!("create {}: {e}", self.root.display())))?;
        let path = self.path_for(receipt.receipt_id);
        if path.exists() {
            return Err(ReceiptError::WormConflict);
        }

        let json = serde_json::to_string_pretty(receipt)
            .map_err(|e| ReceiptError::Storage(e.to_string()))?;
        // create_new guarantees write-once even under concurrent exporters.
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .and_then(|mut f| std::io::Write::write_all(&mut f, json.as_bytes()))
            .map_err(|e| ReceiptError::Storage(format!("worm write {}: {e}", path.display())))?;

        Ok(format!("worm://{}", path.display()))
    }

    /// Re-read an exported receipt by URI.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Storage`] when the URI is foreign or the
    /// content is unreadable.
    pub fn fetch(&self, worm_uri: &str) -> Result<Receipt, ReceiptError> {
        let path = worm_uri
            .strip_prefix("worm://")
            .ok_or_else(|| ReceiptError::Storage(format!("not a worm uri: {worm_uri}")))?;
        let raw = std::fs::read_to_string(Path::new(path))
            .map_err(|e| ReceiptError::Storage(format!("worm read {path}: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| ReceiptError::Storage(e.to_string()))
    }

    fn path_for(&self, receipt_id: uuid::Uuid) -> PathBuf {
        self.root.join(format!("{receipt_id}.json"))
    }
}
