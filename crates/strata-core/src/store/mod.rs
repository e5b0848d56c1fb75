//! Server-side storage for versioned files.

mod versioned;

pub use versioned::VersionedFile;
