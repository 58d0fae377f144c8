//! Turning files on disk into chunkable text.

pub mod chunker;
pub mod extractor;
pub mod walker;
