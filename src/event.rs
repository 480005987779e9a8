use alloy_primitives::{keccak256, Address, B256};
use byteorder::{BigEndian, ByteOrder};
use std::time::Duration;
use thiserror::Error;

use crate::types::JobDescriptor;

/*
    job events arrive abi-style: six 32-byte big-endian head words
    (job id, timeframe in seconds, then one absolute offset per
    variable-length field), followed by a tail of length-prefixed
    spans. offsets index from the start of the buffer. the sub-task
    array span holds its own element count word plus one
    length-prefixed utf-8 span per element, and must be consumed
    exactly. decoding is pure and strict: every read is bounds
    checked, every scalar must fit its target width.
*/

const WORD: usize = 32;

// head words: job_id, timeframe, then offsets for
// job_type, job_description, resource_url, sub_task_types
pub const EVENT_HEAD_LEN: usize = 6 * WORD;

// solidity-style signature the chain watcher filters on
pub const JOB_CREATED_SIGNATURE: &str = "JobCreated(uint32,uint32,string,string,string,string[])";

pub fn job_created_topic() -> B256 {
    keccak256(JOB_CREATED_SIGNATURE.as_bytes())
}

// one raw entry off the chain-log stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,

    pub topic: B256,

    pub block_number: u64,

    pub data: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedEventError {
    #[error("event data is {len} bytes, the head alone takes {EVENT_HEAD_LEN}")]
    BufferTooShort { len: usize },

    #[error("`{field}` word at offset {offset} does not fit its width")]
    ScalarOverflow { field: &'static str, offset: usize },

    #[error("`{field}` offset {target} (head word at {offset}) lands outside the {len}-byte buffer")]
    OffsetOutOfBounds {
        field: &'static str,
        offset: usize,
        target: usize,
        len: usize,
    },

    #[error("`{field}` span of {declared} bytes at offset {offset} exceeds the {available} bytes left")]
    LengthOutOfBounds {
        field: &'static str,
        offset: usize,
        declared: usize,
        available: usize,
    },

    #[error("`{field}` span at offset {offset} is not valid utf-8")]
    InvalidUtf8 { field: &'static str, offset: usize },

    #[error("sub-task array at offset {offset} declares {declared} bytes but its elements consume {consumed}")]
    ArraySpanMismatch {
        offset: usize,
        declared: usize,
        consumed: usize,
    },
}

// strict 32-byte word read: the value must fit in a u64
fn read_word(
    data: &[u8],
    offset: usize,
    field: &'static str,
) -> Result<u64, MalformedEventError> {
    let word = &data[offset..offset + WORD];
    if word[..WORD - 8].iter().any(|b| *b != 0) {
        return Err(MalformedEventError::ScalarOverflow { field, offset });
    }
    Ok(BigEndian::read_u64(&word[WORD - 8..]))
}

fn read_u32_word(
    data: &[u8],
    offset: usize,
    field: &'static str,
) -> Result<u32, MalformedEventError> {
    let value = read_word(data, offset, field)?;
    u32::try_from(value).map_err(|_| MalformedEventError::ScalarOverflow { field, offset })
}

// resolve a head offset word and return the span it addresses
fn read_span<'d>(
    data: &'d [u8],
    head_offset: usize,
    field: &'static str,
) -> Result<(&'d [u8], usize), MalformedEventError> {
    let target = read_word(data, head_offset, field)? as usize;
    if target.checked_add(WORD).map_or(true, |end| end > data.len()) {
        return Err(MalformedEventError::OffsetOutOfBounds {
            field,
            offset: head_offset,
            target,
            len: data.len(),
        });
    }
    let declared = read_word(data, target, field)? as usize;
    let start = target + WORD;
    let available = data.len() - start;
    if declared > available {
        return Err(MalformedEventError::LengthOutOfBounds {
            field,
            offset: target,
            declared,
            available,
        });
    }
    Ok((&data[start..start + declared], start))
}

fn span_to_string(
    span: &[u8],
    offset: usize,
    field: &'static str,
) -> Result<String, MalformedEventError> {
    String::from_utf8(span.to_vec())
        .map_err(|_| MalformedEventError::InvalidUtf8 { field, offset })
}

// parse the nested string array: count word, then per element a
// length word plus raw bytes; the span must be consumed exactly
fn parse_sub_task_types(
    span: &[u8],
    span_offset: usize,
) -> Result<Vec<String>, MalformedEventError> {
    let field = "subTaskTypes";
    let declared = span.len();
    let mismatch = |consumed| MalformedEventError::ArraySpanMismatch {
        offset: span_offset,
        declared,
        consumed,
    };
    if declared < WORD {
        return Err(mismatch(declared));
    }
    let count = read_u32_word(span, 0, field)? as usize;
    let mut pos = WORD;
    let mut elements = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        if pos + WORD > declared {
            return Err(mismatch(pos));
        }
        let elem_len = read_word(span, pos, field)? as usize;
        let start = pos + WORD;
        if elem_len > declared - start {
            return Err(MalformedEventError::LengthOutOfBounds {
                field,
                offset: span_offset + pos,
                declared: elem_len,
                available: declared - start,
            });
        }
        elements.push(span_to_string(
            &span[start..start + elem_len],
            span_offset + start,
            field,
        )?);
        pos = start + elem_len;
    }
    if pos != declared {
        return Err(mismatch(pos));
    }
    Ok(elements)
}

// decode one job event buffer into a descriptor; pure, no side effects
pub fn decode_job_event(data: &[u8]) -> Result<JobDescriptor, MalformedEventError> {
    if data.len() < EVENT_HEAD_LEN {
        return Err(MalformedEventError::BufferTooShort { len: data.len() });
    }
    let job_id = read_u32_word(data, 0, "jobId")?;
    let timeframe_secs = read_u32_word(data, WORD, "timeframe")?;

    let (job_type_span, job_type_at) = read_span(data, 2 * WORD, "jobType")?;
    let (description_span, description_at) = read_span(data, 3 * WORD, "jobDescription")?;
    let (url_span, url_at) = read_span(data, 4 * WORD, "resourceUrl")?;
    let (sub_tasks_span, sub_tasks_at) = read_span(data, 5 * WORD, "subTaskTypes")?;

    Ok(JobDescriptor {
        job_id,
        job_type: span_to_string(job_type_span, job_type_at, "jobType")?,
        job_description: span_to_string(description_span, description_at, "jobDescription")?,
        resource_url: span_to_string(url_span, url_at, "resourceUrl")?,
        timeframe: Duration::from_secs(u64::from(timeframe_secs)),
        sub_task_types: parse_sub_task_types(sub_tasks_span, sub_tasks_at)?,
    })
}

fn push_word(buf: &mut Vec<u8>, value: u64) {
    let mut word = [0u8; WORD];
    BigEndian::write_u64(&mut word[WORD - 8..], value);
    buf.extend_from_slice(&word);
}

fn push_span(buf: &mut Vec<u8>, bytes: &[u8]) {
    push_word(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

// reference encoder: tail spans laid out in field order, no padding,
// so decode and encode round-trip byte-identically
pub fn encode_job_event(job: &JobDescriptor) -> Vec<u8> {
    let mut sub_tasks = Vec::new();
    push_word(&mut sub_tasks, job.sub_task_types.len() as u64);
    for sub_task in &job.sub_task_types {
        push_span(&mut sub_tasks, sub_task.as_bytes());
    }

    let mut tail = Vec::new();
    let mut offsets = [0u64; 4];
    let fields: [&[u8]; 4] = [
        job.job_type.as_bytes(),
        job.job_description.as_bytes(),
        job.resource_url.as_bytes(),
        &sub_tasks,
    ];
    for (slot, bytes) in offsets.iter_mut().zip(fields) {
        *slot = (EVENT_HEAD_LEN + tail.len()) as u64;
        push_span(&mut tail, bytes);
    }

    let mut buf = Vec::with_capacity(EVENT_HEAD_LEN + tail.len());
    push_word(&mut buf, u64::from(job.job_id));
    push_word(&mut buf, job.timeframe.as_secs());
    for offset in offsets {
        push_word(&mut buf, offset);
    }
    buf.extend_from_slice(&tail);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> JobDescriptor {
        JobDescriptor {
            job_id: 42,
            job_type: "price-feed".to_string(),
            job_description: "push ETH/USD on deviation".to_string(),
            resource_url: "https://jobs.example/42".to_string(),
            timeframe: Duration::from_secs(90),
            sub_task_types: vec!["fetch".to_string(), "report".to_string(), "verify".to_string()],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let job = sample_job();
        let buf = encode_job_event(&job);
        let decoded = decode_job_event(&buf).unwrap();
        assert_eq!(decoded, job);
        assert_eq!(encode_job_event(&decoded), buf);
    }

    #[test]
    fn empty_sub_task_array_round_trips() {
        let mut job = sample_job();
        job.sub_task_types.clear();
        let buf = encode_job_event(&job);
        assert_eq!(decode_job_event(&buf).unwrap(), job);
    }

    #[test]
    fn every_strict_prefix_is_rejected() {
        let buf = encode_job_event(&sample_job());
        for cut in 0..buf.len() {
            assert!(
                decode_job_event(&buf[..cut]).is_err(),
                "prefix of {cut} bytes decoded"
            );
        }
    }

    #[test]
    fn short_head_reports_buffer_too_short() {
        let err = decode_job_event(&[0u8; 100]).unwrap_err();
        assert_eq!(err, MalformedEventError::BufferTooShort { len: 100 });
    }

    #[test]
    fn wild_offset_reports_field_and_target() {
        let mut buf = encode_job_event(&sample_job());
        // point the job_type offset far past the end
        buf[2 * WORD + 24..3 * WORD].copy_from_slice(&0x10_0000u64.to_be_bytes());
        match decode_job_event(&buf).unwrap_err() {
            MalformedEventError::OffsetOutOfBounds { field, target, .. } => {
                assert_eq!(field, "jobType");
                assert_eq!(target, 0x10_0000);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn oversized_length_is_rejected() {
        let job = sample_job();
        let mut buf = encode_job_event(&job);
        // inflate the job_description length word past the buffer end
        let descr_at = EVENT_HEAD_LEN + WORD + job.job_type.len();
        buf[descr_at + 24..descr_at + WORD].copy_from_slice(&10_000u64.to_be_bytes());
        match decode_job_event(&buf).unwrap_err() {
            MalformedEventError::LengthOutOfBounds { field, declared, .. } => {
                assert_eq!(field, "jobDescription");
                assert_eq!(declared, 10_000);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn scalar_with_high_bytes_set_is_rejected() {
        let mut buf = encode_job_event(&sample_job());
        buf[3] = 0xff;
        assert_eq!(
            decode_job_event(&buf).unwrap_err(),
            MalformedEventError::ScalarOverflow { field: "jobId", offset: 0 }
        );
    }

    #[test]
    fn job_id_wider_than_u32_is_rejected() {
        let mut job = sample_job();
        job.job_id = u32::MAX;
        let mut buf = encode_job_event(&job);
        // bump the word into u64 territory
        buf[27] = 0x01;
        assert_eq!(
            decode_job_event(&buf).unwrap_err(),
            MalformedEventError::ScalarOverflow { field: "jobId", offset: 0 }
        );
    }

    #[test]
    fn invalid_utf8_names_the_field() {
        let mut buf = encode_job_event(&sample_job());
        // first content byte of job_type
        buf[EVENT_HEAD_LEN + WORD] = 0xff;
        match decode_job_event(&buf).unwrap_err() {
            MalformedEventError::InvalidUtf8 { field, .. } => assert_eq!(field, "jobType"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn array_count_must_match_span() {
        let job = sample_job();
        let mut buf = encode_job_event(&job);
        // the array span starts after the three string fields
        let strings_len: usize = [&job.job_type, &job.job_description, &job.resource_url]
            .iter()
            .map(|s| WORD + s.len())
            .sum();
        let array_at = EVENT_HEAD_LEN + strings_len + WORD;
        // claim one element while three are present
        buf[array_at + 24..array_at + WORD].copy_from_slice(&1u64.to_be_bytes());
        match decode_job_event(&buf).unwrap_err() {
            MalformedEventError::ArraySpanMismatch { declared, consumed, .. } => {
                assert!(consumed < declared);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn topic_is_derived_from_the_declared_signature() {
        assert_eq!(job_created_topic(), keccak256(JOB_CREATED_SIGNATURE.as_bytes()));
        assert_ne!(job_created_topic(), B256::ZERO);
    }
}
