// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receipt persistence: JSON files on disk with an in-memory index.
//!
//! The store hydrates existing receipts at open, so chain heads and lookups
//! survive restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use uuid::Uuid;

use crate::{Receipt, ReceiptError};

/// File-backed receipt store.
#[derive(Debug)]
pub struct ReceiptStore {
    dir: Option<PathBuf>,
    index: RwLock<HashMap<Uuid, Receipt>>,
}

impl ReceiptStore {
    /// Purely in-memory store (tests, ephemeral tooling).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Open a store rooted at `dir`, hydrating any existing receipts.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Storage`] when the directory cannot be created
    /// or an existing receipt fails to parse.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ReceiptError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ReceiptError::Storage(format!("create {}: {e}", dir.display())))?;

        let mut index = HashMap::new();
        for entry in std::fs::read_dir(&dir)
            .map_err(|e| ReceiptError::Storage(format!("read {}: {e}", dir.display())))?
        {
            let entry = entry.map_err(|e| ReceiptError::Storage(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| ReceiptError::Storage(format!("read {}: {e}", path.display())))?;
            let receipt: Receipt = serde_json::from_str(&raw)
                .map_err(|e| ReceiptError::Storage(format!("parse {}: {e}", path.display())))?;
            index.insert(receipt.receipt_id, receipt);
        }

        Ok(Self {
            dir: Some(dir),
            index: RwLock::new(index),
        })
    }

    /// Persist a receipt. Receipts are immutable: saving an existing id is a
    /// conflict.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Storage`] on I/O failure or duplicate id.
    pub fn save(&self, receipt: &Receipt) -> Result<(), ReceiptError> {
        {
            let index = self.index.read().map_err(|_| poisoned())?;
            if index.contains_key(&receipt.receipt_id) {
                return Err(ReceiptError::Storage(format!(
                    "receipt {} already stored",
                    receipt.receipt_id
                )));
            }
        }
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.json", receipt.receipt_id));
            let json = serde_json::to_string_pretty(receipt)
                .map_err(|e| ReceiptError::Storage(e.to_string()))?;
            std::fs::write(&path, json)
                .map_err(|e| ReceiptError::Storage(format!("write {}: {e}", path.display())))?;
        }
        self.index
            .write()
            .map_err(|_| poisoned())?
            .insert(receipt.receipt_id, receipt.clone());
        Ok(())
    }

    /// Look up a receipt for a tenant.
    #[must_use]
    pub fn get(&self, tenant_id: &str, receipt_id: Uuid) -> Option<Receipt> {
        let index = self.index.read().ok()?;
        index
            .get(&receipt_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
    }

    /// All receipts for a tenant, oldest first.
    #[must_use]
    pub fn list_tenant(&self, tenant_id: &str) -> Vec<Receipt> {
        let Ok(index) = self.index.read() else {
            return Vec::new();
        };
        let mut receipts: Vec<Receipt> = index
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        receipts.sort_by_key(|r| r.created_at);
        receipts
    }

    /// Every stored receipt across tenants, oldest first.
    #[must_use]
    pub fn list_all(&self) -> Vec<Receipt> {
        let Ok(index) = self.index.read() else {
            return Vec::new();
        };
        let mut receipts: Vec<Receipt> = index.values().cloned().collect();
        receipts.sort_by_key(|r| r.created_at);
        receipts
    }

    /// Number of stored receipts across tenants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().map(|i| i.len()).unwrap_or(0)
    }

    /// Returns `true` when the store holds no receipts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> ReceiptError {
    ReceiptError::Storage("receipt index lock poisoned".into())
}
