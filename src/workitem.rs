//! Wire codec for copy-work descriptors exchanged through the
//! work-stealing queue.
//!
//! Layout: `size|chunk|offset|op|operand_len|operand`. The operand is a
//! raw path; its explicit length removes any ambiguity when the path
//! itself contains the delimiter. A parse failure means the queue is
//! corrupt and the whole operation must fail.

use std::path::PathBuf;

use crate::error::{ArchiveError, Result};

/// Copy one chunk of a source file into the archive's data region.
pub const OP_COPY_DATA: u32 = 1;

/// Upper bound on one encoded queue item.
pub const MAX_ITEM_SIZE: usize = 8192;

const DELIM: u8 = b'|';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub op: u32,
    /// Total size of the source file, so the consumer can recognize the
    /// final chunk and write the trailing padding.
    pub file_size: u64,
    pub chunk_index: u64,
    /// Archive offset where this file's data region starts.
    pub data_offset: u64,
    pub source: PathBuf,
}

fn path_to_bytes(path: &PathBuf) -> Vec<u8> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    }
    #[cfg(not(unix))]
    {
        path.to_string_lossy().into_owned().into_bytes()
    }
}

fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    #[cfg(unix)]
    {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        PathBuf::from(OsStr::from_bytes(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl WorkItem {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let operand = path_to_bytes(&self.source);
        let mut out = format!(
            "{}|{}|{}|{}|{}|",
            self.file_size,
            self.chunk_index,
            self.data_offset,
            self.op,
            operand.len()
        )
        .into_bytes();
        out.extend_from_slice(&operand);
        if out.len() > MAX_ITEM_SIZE {
            return Err(ArchiveError::Queue(format!(
                "encoded item of {} bytes exceeds the queue limit",
                out.len()
            )));
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<WorkItem> {
        let mut rest = bytes;
        let mut next_field = |what: &str| -> Result<u64> {
            let pos = rest
                .iter()
                .position(|&b| b == DELIM)
                .ok_or_else(|| ArchiveError::Queue(format!("missing {what} field")))?;
            let field = std::str::from_utf8(&rest[..pos])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ArchiveError::Queue(format!("{what} field not numeric")))?;
            rest = &rest[pos + 1..];
            Ok(field)
        };

        let file_size = next_field("file-size")?;
        let chunk_index = next_field("chunk-index")?;
        let data_offset = next_field("data-offset")?;
        let op = next_field("op-code")? as u32;
        let operand_len = next_field("operand-length")? as usize;

        if rest.len() != operand_len {
            return Err(ArchiveError::Queue(format!(
                "operand length {operand_len} does not match {} remaining bytes",
                rest.len()
            )));
        }
        if op != OP_COPY_DATA {
            return Err(ArchiveError::Queue(format!("unknown op-code {op}")));
        }

        Ok(WorkItem {
            op,
            file_size,
            chunk_index,
            data_offset,
            source: path_from_bytes(rest),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(source: &str) -> WorkItem {
        WorkItem {
            op: OP_COPY_DATA,
            file_size: 1_234_567,
            chunk_index: 42,
            data_offset: 9_216,
            source: PathBuf::from(source),
        }
    }

    #[test]
    fn roundtrip() {
        let original = item("/data/project/file.bin");
        let decoded = WorkItem::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn delimiter_in_path_survives() {
        let original = item("/data/we|rd|name");
        let decoded = WorkItem::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded.source, PathBuf::from("/data/we|rd|name"));
    }

    #[test]
    fn truncated_item_is_a_queue_error() {
        let mut bytes = item("/a/b").encode().unwrap();
        bytes.pop();
        assert!(matches!(
            WorkItem::decode(&bytes),
            Err(ArchiveError::Queue(_))
        ));
    }

    #[test]
    fn unknown_op_is_a_queue_error() {
        let mut it = item("/a");
        it.op = 99;
        let bytes = it.encode().unwrap();
        assert!(matches!(
            WorkItem::decode(&bytes),
            Err(ArchiveError::Queue(_))
        ));
    }

    #[test]
    fn garbage_is_a_queue_error() {
        assert!(WorkItem::decode(b"not an item").is_err());
        assert!(WorkItem::decode(b"").is_err());
    }
}
