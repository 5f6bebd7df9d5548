//! Fixed limits and format constants.

/// Maximum container nesting depth followed by a single build or construct.
pub const MAX_BUILD_DEPTH: usize = 256;

/// Magic prefix of a zstd-compressed JSON builder document.
pub const MAGIC_COMPRESSED: &[u8; 5] = b"HDMFZ";

/// Default zstd level used by the JSON backend.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Maximum size of a decompressed builder document (1 GiB).
pub const MAX_DOCUMENT_SIZE: usize = 1 << 30;

/// Suffix of the dataset that carries cumulative offsets for a ragged column.
pub const INDEX_SUFFIX: &str = "_index";

/// Attribute on an index dataset that points at its data dataset.
pub const INDEX_TARGET_ATTR: &str = "target";
