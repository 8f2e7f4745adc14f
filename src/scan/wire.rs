//! Scan batch wire format
//!
//! A request batch is a concatenation of elements:
//!
//! ```text
//! hash[W] | label_len: u16 LE | label[label_len]
//! ```
//!
//! A result batch holds one element per matching request, each followed by
//! the match description:
//!
//! ```text
//! hash[W] | label_len: u16 LE | label | match_len: u32 LE | match[match_len]
//! ```

use crate::error::WireError;

/// One decoded request element, borrowing the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRequest<'a> {
    pub hash: &'a [u8],
    pub label: &'a [u8],
}

/// One decoded result element, borrowing the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanMatch<'a> {
    pub hash: &'a [u8],
    pub label: &'a [u8],
    pub description: &'a [u8],
}

impl ScanMatch<'_> {
    /// Label and description as text (lossy)
    pub fn label_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.label)
    }

    pub fn description_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.description)
    }
}

/// Sequential reader over a byte batch
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], WireError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(WireError::Truncated {
                offset: self.offset,
                len: self.data.len(),
                field,
            })?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn u16_le(&mut self, field: &'static str) -> Result<u16, WireError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32_le(&mut self, field: &'static str) -> Result<u32, WireError> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn is_done(&self) -> bool {
        self.offset >= self.data.len()
    }
}

/// Iterator over the request elements of a batch.
///
/// Yields an error for a truncated element and then stops; the rest of the
/// batch is not decoded.
pub struct RequestDecoder<'a> {
    reader: Reader<'a>,
    hash_width: usize,
    failed: bool,
}

impl<'a> RequestDecoder<'a> {
    pub fn new(data: &'a [u8], hash_width: usize) -> Self {
        Self {
            reader: Reader { data, offset: 0 },
            hash_width,
            failed: false,
        }
    }

    fn decode_one(&mut self) -> Result<ScanRequest<'a>, WireError> {
        let hash = self.reader.take(self.hash_width, "hash")?;
        let label_len = self.reader.u16_le("label length")? as usize;
        let label = self.reader.take(label_len, "label")?;
        Ok(ScanRequest { hash, label })
    }
}

impl<'a> Iterator for RequestDecoder<'a> {
    type Item = Result<ScanRequest<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.is_done() {
            return None;
        }
        let element = self.decode_one();
        self.failed = element.is_err();
        Some(element)
    }
}

/// Iterator over the elements of a result batch
pub struct MatchDecoder<'a> {
    reader: Reader<'a>,
    hash_width: usize,
    failed: bool,
}

impl<'a> MatchDecoder<'a> {
    pub fn new(data: &'a [u8], hash_width: usize) -> Self {
        Self {
            reader: Reader { data, offset: 0 },
            hash_width,
            failed: false,
        }
    }

    fn decode_one(&mut self) -> Result<ScanMatch<'a>, WireError> {
        let hash = self.reader.take(self.hash_width, "hash")?;
        let label_len = self.reader.u16_le("label length")? as usize;
        let label = self.reader.take(label_len, "label")?;
        let match_len = self.reader.u32_le("match length")? as usize;
        let description = self.reader.take(match_len, "match")?;
        Ok(ScanMatch {
            hash,
            label,
            description,
        })
    }
}

impl<'a> Iterator for MatchDecoder<'a> {
    type Item = Result<ScanMatch<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.is_done() {
            return None;
        }
        let element = self.decode_one();
        self.failed = element.is_err();
        Some(element)
    }
}

fn put_hash_and_label(
    out: &mut Vec<u8>,
    hash: &[u8],
    label: &[u8],
    hash_width: usize,
) -> Result<(), WireError> {
    if hash.len() != hash_width {
        return Err(WireError::HashWidth {
            expected: hash_width,
            actual: hash.len(),
        });
    }
    let label_len = u16::try_from(label.len()).map_err(|_| WireError::LabelTooLong(label.len()))?;

    out.extend_from_slice(hash);
    out.extend_from_slice(&label_len.to_le_bytes());
    out.extend_from_slice(label);
    Ok(())
}

/// Append one request element to `out`
pub fn encode_request(
    out: &mut Vec<u8>,
    hash: &[u8],
    label: &[u8],
    hash_width: usize,
) -> Result<(), WireError> {
    put_hash_and_label(out, hash, label, hash_width)
}

/// Append one result element to `out`
pub fn encode_match(
    out: &mut Vec<u8>,
    request: &ScanRequest<'_>,
    description: &[u8],
) -> Result<(), WireError> {
    let match_len = u32::try_from(description.len())
        .map_err(|_| WireError::MatchTooLong(description.len()))?;

    put_hash_and_label(out, request.hash, request.label, request.hash.len())?;
    out.extend_from_slice(&match_len.to_le_bytes());
    out.extend_from_slice(description);
    Ok(())
}

/// Builder for request batches of a fixed hash width
#[derive(Debug, Clone)]
pub struct RequestBatch {
    data: Vec<u8>,
    hash_width: usize,
    count: usize,
}

impl RequestBatch {
    pub fn new(hash_width: usize) -> Self {
        Self {
            data: Vec::new(),
            hash_width,
            count: 0,
        }
    }

    /// Append one `(hash, label)` element
    pub fn push(&mut self, hash: &[u8], label: &[u8]) -> Result<(), WireError> {
        encode_request(&mut self.data, hash, label, self.hash_width)?;
        self.count += 1;
        Ok(())
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Hand out the encoded batch and start a new one
    pub fn take(&mut self) -> Vec<u8> {
        self.count = 0;
        std::mem::take(&mut self.data)
    }
}
