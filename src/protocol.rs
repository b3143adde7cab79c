//! Purpose: Classify complete inbound records as appendable data or seek requests.
//! Exports: `SEEK_PREFIX`, `SeekRequest`, `Inbound`, `classify_record`.
//! Role: Wire-protocol parsing shared by the server and its tests.
//! Invariants: Seek parsing is strict; anything after the prefix that is not
//! `<index>,<offset>` plus the record delimiter is a malformed request.
use crate::core::error::{Error, ErrorKind};
use crate::core::record::{DELIMITER, Record};

/// Records starting with this prefix are positioning requests, not data.
pub const SEEK_PREFIX: &[u8] = b"SEEKTO:";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SeekRequest {
    /// 0-based ordinal among currently occupied records, oldest first.
    pub command_index: usize,
    /// Byte offset within that record.
    pub intra_offset: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Inbound {
    /// Append the record verbatim, delimiter included.
    Data,
    Seek(SeekRequest),
}

/// Classifies one complete record. Returns `Usage` errors for records that
/// carry the seek prefix but not a well-formed request; those must be
/// rejected without being appended.
pub fn classify_record(record: &Record) -> Result<Inbound, Error> {
    let bytes = record.as_bytes();
    let Some(body) = bytes.strip_prefix(SEEK_PREFIX) else {
        return Ok(Inbound::Data);
    };
    let body = body.strip_suffix(&[DELIMITER]).unwrap_or(body);

    let text = std::str::from_utf8(body).map_err(|_| malformed("seek request is not valid UTF-8"))?;
    let Some((index_text, offset_text)) = text.split_once(',') else {
        return Err(malformed("seek request is missing the ',' separator"));
    };

    let command_index = parse_field(index_text, "command index")?;
    let intra_offset = parse_field(offset_text, "intra-command offset")?;

    Ok(Inbound::Seek(SeekRequest {
        command_index,
        intra_offset,
    }))
}

fn parse_field(text: &str, what: &str) -> Result<usize, Error> {
    if text.is_empty() || !text.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(malformed(format!("seek request has a non-numeric {what}")));
    }
    text.parse::<usize>()
        .map_err(|_| malformed(format!("seek request {what} is out of range")))
}

fn malformed(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(message)
        .with_hint(format!(
            "Send {}<index>,<offset> followed by a newline.",
            std::str::from_utf8(SEEK_PREFIX).unwrap_or("SEEKTO:")
        ))
}
