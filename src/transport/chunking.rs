//! Splitting a submission into several multipart requests

use serde::{Deserialize, Serialize};

/// Form field added to every request except the last of a split submission
pub const INCOMPLETE_PART: &str = "*isIncomplete*";

/// Per-request limits for submission uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLimits {
    /// Byte threshold a request may not cross by adding another attachment
    pub max_request_bytes: u64,
    /// A request closes once it holds more attachments than this
    pub max_files_per_request: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_request_bytes: 10 * 1024 * 1024,
            max_files_per_request: 100,
        }
    }
}

/// One multipart request: the XML plus a contiguous run of attachments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestChunk {
    /// Attachment indices carried by this request
    pub attachments: std::ops::Range<usize>,
    /// More requests follow
    pub incomplete: bool,
}

/// Plan the requests for a submission.
///
/// The XML goes in every request. After attachment `i` is added, the
/// request is closed (and flagged incomplete) when another attachment
/// follows and either the request already holds more than
/// `max_files_per_request` attachments or adding the next one would push
/// the byte count past `max_request_bytes`. A request always carries at
/// least one attachment when any remain, so an oversized file is sent on
/// its own rather than dropped.
pub fn plan_chunks(xml_len: u64, attachment_lens: &[u64], limits: &ChunkLimits) -> Vec<RequestChunk> {
    if attachment_lens.is_empty() {
        return vec![RequestChunk {
            attachments: 0..0,
            incomplete: false,
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < attachment_lens.len() {
        let mut bytes = xml_len;
        let mut end = start;
        let mut incomplete = false;

        while end < attachment_lens.len() {
            bytes += attachment_lens[end];
            end += 1;

            if end < attachment_lens.len() {
                let in_request = end - start;
                if in_request > limits.max_files_per_request
                    || bytes + attachment_lens[end] > limits.max_request_bytes
                {
                    incomplete = true;
                    break;
                }
            }
        }

        chunks.push(RequestChunk {
            attachments: start..end,
            incomplete,
        });
        start = end;
    }
    chunks
}
