//! Cross-cutting application constants.

/// Directory prefix of every entry inside a sealed archive (`archive-<id>/`).
pub const ARCHIVE_ROOT_PREFIX: &str = "archive-";

/// File suffix of a sealed archive.
pub const SEALED_SUFFIX: &str = ".tar.gz";

/// Permission bits of a working bundle directory.
pub const WORK_DIR_MODE: u32 = 0o700;

/// Permission bits of files inside a sealed archive.
pub const ARCHIVE_ENTRY_MODE: u32 = 0o644;
