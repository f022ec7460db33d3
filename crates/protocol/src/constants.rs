//! Endpoint paths and multipart field names.

/// Starts a chunked upload session.
pub const CHUNKED_INIT: &str = "chunked/init";

/// Uploads one chunk of an active session.
pub const CHUNKED_UPLOAD: &str = "chunked/upload";

/// Assembles the uploaded chunks into the final file.
pub const CHUNKED_COMPLETE: &str = "chunked/complete";

/// Status of a session (`GET chunked/status/{upload_id}`).
pub const CHUNKED_STATUS: &str = "chunked/status";

/// Discards a session (`DELETE chunked/cancel/{upload_id}`).
pub const CHUNKED_CANCEL: &str = "chunked/cancel";

// Multipart form field names.
pub const FIELD_FILENAME: &str = "filename";
pub const FIELD_TOTAL_SIZE: &str = "total_size";
pub const FIELD_TOTAL_CHUNKS: &str = "total_chunks";
pub const FIELD_BATCH_ID: &str = "batch_id";
pub const FIELD_IMPORT_BATCH_ID: &str = "import_batch_id";
pub const FIELD_RELATIVE_PATH: &str = "relative_path";
pub const FIELD_UPLOAD_ID: &str = "upload_id";
pub const FIELD_CHUNK_INDEX: &str = "chunk_index";
pub const FIELD_CHUNK: &str = "chunk";
pub const FIELD_FILE: &str = "file";
