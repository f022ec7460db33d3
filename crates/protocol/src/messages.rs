use serde::{Deserialize, Serialize};

use crate::constants::{
    FIELD_BATCH_ID, FIELD_FILENAME, FIELD_IMPORT_BATCH_ID, FIELD_RELATIVE_PATH,
    FIELD_TOTAL_CHUNKS, FIELD_TOTAL_SIZE, FIELD_UPLOAD_ID,
};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Starts a chunked upload session.
///
/// Sent as multipart form fields, see [`form_fields`](Self::form_fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitUploadRequest {
    pub filename: String,
    pub total_size: u64,
    pub total_chunks: usize,
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
}

impl InitUploadRequest {
    /// Returns the text form fields in wire order. Optional fields are
    /// omitted when absent or empty.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            (FIELD_FILENAME, self.filename.clone()),
            (FIELD_TOTAL_SIZE, self.total_size.to_string()),
            (FIELD_TOTAL_CHUNKS, self.total_chunks.to_string()),
            (FIELD_BATCH_ID, self.batch_id.clone()),
        ];
        if let Some(id) = self.import_batch_id.as_deref().filter(|s| !s.is_empty()) {
            fields.push((FIELD_IMPORT_BATCH_ID, id.to_string()));
        }
        if let Some(path) = self.relative_path.as_deref().filter(|s| !s.is_empty()) {
            fields.push((FIELD_RELATIVE_PATH, path.to_string()));
        }
        fields
    }
}

/// Finalizes a chunked upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteUploadRequest {
    pub upload_id: String,
    pub batch_id: String,
}

impl CompleteUploadRequest {
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (FIELD_UPLOAD_ID, self.upload_id.clone()),
            (FIELD_BATCH_ID, self.batch_id.clone()),
        ]
    }
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

// The backend has shipped both snake_case and camelCase field names, so every
// response accepts either spelling.

/// Response to `chunked/init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitUploadResponse {
    #[serde(alias = "uploadId")]
    pub upload_id: String,
}

/// Response to `chunked/upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAck {
    /// Absent when the server short-circuits a duplicate submission.
    #[serde(default, alias = "chunkIndex", skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    /// Older servers answer `{"success": true}` instead of `received`.
    /// One of the two must be present.
    #[serde(alias = "success")]
    pub received: bool,
}

impl ChunkAck {
    /// A positive acknowledgment for `index`.
    pub fn received(index: usize) -> Self {
        Self {
            chunk_index: Some(index),
            received: true,
        }
    }

    /// Returns `true` if this response confirms receipt of chunk `index`.
    pub fn confirms(&self, index: usize) -> bool {
        self.received && self.chunk_index.is_none_or(|i| i == index)
    }
}

/// Response to `chunked/complete` and to a direct upload.
///
/// Only `file_id` is interpreted; everything else the server sends is kept
/// in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteUploadResponse {
    #[serde(alias = "fileId")]
    pub file_id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Response to `chunked/status/{upload_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadStatusResponse {
    #[serde(alias = "uploadId")]
    pub upload_id: String,
    #[serde(alias = "totalChunks")]
    pub total_chunks: usize,
    #[serde(alias = "receivedChunks")]
    pub received_chunks: usize,
    #[serde(default, alias = "missingChunks")]
    pub missing_chunks: Vec<usize>,
    #[serde(default)]
    pub progress: f64,
}

impl UploadStatusResponse {
    /// Returns `true` when the server holds every chunk.
    pub fn is_complete(&self) -> bool {
        self.missing_chunks.is_empty() && self.received_chunks >= self.total_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_init() -> InitUploadRequest {
        InitUploadRequest {
            filename: "report.pdf".into(),
            total_size: 15 * 1024 * 1024,
            total_chunks: 3,
            batch_id: "b-1".into(),
            import_batch_id: None,
            relative_path: None,
        }
    }

    #[test]
    fn init_form_fields_skip_absent_optionals() {
        let fields = sample_init().form_fields();
        let names: Vec<&str> = fields.iter().map(|(k, _)| *k).collect();
        assert_eq!(names, vec!["filename", "total_size", "total_chunks", "batch_id"]);
        assert_eq!(fields[1].1, "15728640");
        assert_eq!(fields[2].1, "3");
    }

    #[test]
    fn init_form_fields_include_folder_metadata() {
        let req = InitUploadRequest {
            import_batch_id: Some("imp-7".into()),
            relative_path: Some("scans/2024/report.pdf".into()),
            ..sample_init()
        };
        let fields = req.form_fields();
        assert!(fields.contains(&("import_batch_id", "imp-7".to_string())));
        assert!(fields.contains(&("relative_path", "scans/2024/report.pdf".to_string())));
    }

    #[test]
    fn init_form_fields_treat_empty_as_absent() {
        let req = InitUploadRequest {
            import_batch_id: Some(String::new()),
            relative_path: Some(String::new()),
            ..sample_init()
        };
        assert_eq!(req.form_fields().len(), 4);
    }

    #[test]
    fn init_response_accepts_both_spellings() {
        let snake: InitUploadResponse = serde_json::from_str(r#"{"upload_id":"u1"}"#).unwrap();
        let camel: InitUploadResponse =
            serde_json::from_str(r#"{"uploadId":"u1","chunkSize":5242880}"#).unwrap();
        assert_eq!(snake, camel);
    }

    #[test]
    fn chunk_ack_confirms_matching_index() {
        let ack: ChunkAck = serde_json::from_str(r#"{"chunk_index":2,"received":true}"#).unwrap();
        assert_eq!(ack, ChunkAck::received(2));
        assert!(ack.confirms(2));
        assert!(!ack.confirms(3));

        let legacy: ChunkAck =
            serde_json::from_str(r#"{"success":true,"chunkIndex":4,"chunkSize":10}"#).unwrap();
        assert!(legacy.confirms(4));
    }

    #[test]
    fn chunk_ack_duplicate_without_index() {
        let dup: ChunkAck =
            serde_json::from_str(r#"{"success":true,"message":"Chunk 1 already received"}"#)
                .unwrap();
        assert_eq!(dup.chunk_index, None);
        assert!(dup.confirms(1));

        let refused: ChunkAck =
            serde_json::from_str(r#"{"chunk_index":1,"received":false}"#).unwrap();
        assert!(!refused.confirms(1));
    }

    #[test]
    fn chunk_ack_requires_an_acknowledgment_field() {
        assert!(serde_json::from_str::<ChunkAck>("{}").is_err());
        assert!(serde_json::from_str::<ChunkAck>(r#"{"chunk_index":1}"#).is_err());
    }

    #[test]
    fn complete_response_keeps_extra_fields() {
        let resp: CompleteUploadResponse = serde_json::from_str(
            r#"{"fileId":"f-1","fileName":"x.pdf","size":42,"url":"static/x.pdf"}"#,
        )
        .unwrap();
        assert_eq!(resp.file_id, "f-1");
        assert_eq!(resp.extra.get("size"), Some(&serde_json::json!(42)));
        assert!(!resp.extra.contains_key("fileId"));
    }

    #[test]
    fn status_response_completion() {
        let resp: UploadStatusResponse = serde_json::from_str(
            r#"{"uploadId":"u1","totalChunks":3,"receivedChunks":2,"missingChunks":[1],"progress":66.6}"#,
        )
        .unwrap();
        assert!(!resp.is_complete());
        assert_eq!(resp.missing_chunks, vec![1]);

        let done = UploadStatusResponse {
            received_chunks: 3,
            missing_chunks: Vec::new(),
            ..resp
        };
        assert!(done.is_complete());
    }
}
