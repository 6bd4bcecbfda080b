//! Raw access to the block-structured objects file.

pub mod block_file;

pub use block_file::BlockFile;
