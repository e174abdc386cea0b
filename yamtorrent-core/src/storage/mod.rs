//! Storage layer for torrent data.
//!
//! A download is written in place into one preallocated output file that
//! carries an in-progress suffix until every piece is verified.

pub mod output_file;

pub use output_file::OutputFile;

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Write would extend past the preallocated length
    #[error("Write of {length} bytes at offset {offset} exceeds file length {file_length}")]
    WritePastEnd {
        /// Byte offset of the attempted write
        offset: u64,
        /// Number of bytes in the attempted write
        length: u64,
        /// Preallocated file length
        file_length: u64,
    },

    /// File system specific error occurred
    #[error("File system error: {message}")]
    FilesystemError {
        /// Description of the file system error
        message: String,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
