// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Storage error types.

/// Errors that can occur in storage operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("key too large: {size} > {max}")]
    KeyTooLarge { size: usize, max: usize },

    #[error("value too large: {size} > {max}")]
    ValueTooLarge { size: usize, max: usize },

    #[error("chunk {chunk} not found")]
    ChunkNotFound { chunk: u64 },

    #[error("map {map_id} is closed")]
    MapClosed { map_id: u32 },

    #[error("storage corruption: {0}")]
    Corruption(String),
}

impl StorageError {
    /// Returns true if this error is transient and the caller may reseek
    /// a cursor instead of failing the operation.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::ChunkNotFound { .. })
    }
}
