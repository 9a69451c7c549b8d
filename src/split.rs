//! Quality-weighted vector-read splitting.
//!
//! Partitions a scatter list between the two active sources so that the
//! better source (lower quality number) receives the larger share. Bytes are
//! peeled off the front of the list for the first source and off the back for
//! the second, in alternating rounds whose budgets are proportional to the
//! peer source's quality, capped at [`MAX_CHUNK`] per round.
//!
//! Both halves come out offset-sorted, with contiguous neighbours merged up
//! to the chunk cap, and together they cover exactly the input bytes.

use crate::config::MAX_CHUNK;
use crate::request::IoSegment;
use tracing::debug;

/// Splits `iolist` into two sub-requests weighted by source quality.
///
/// `quality0` / `quality1` are the qualities of the first and second active
/// source; the first half is intended for the first source. Input entries
/// must be strictly offset-ascending and no larger than [`MAX_CHUNK`].
pub fn split_client_request(
    iolist: &[IoSegment],
    quality0: u32,
    quality1: u32,
) -> (Vec<IoSegment>, Vec<IoSegment>) {
    if iolist.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let q1 = quality0.max(1) as f64;
    let q2 = quality1.max(1) as f64;
    let chunk1 = (MAX_CHUNK as f64 * (q2 / (q1 + q2))) as u64;
    let chunk2 = (MAX_CHUNK as f64 * (q1 / (q1 + q2))) as u64;

    let mut tmp: Vec<IoSegment> = iolist.to_vec();
    let mut req1 = Vec::with_capacity(iolist.len() / 2 + 1);
    let mut req2 = Vec::with_capacity(iolist.len() / 2 + 1);
    let mut front = 0usize;

    while tmp.len() > front {
        consume_chunk_front(&mut front, &mut tmp, &mut req1, chunk1);
        consume_chunk_back(front, &mut tmp, &mut req2, chunk2);
    }

    // The peeling builds two locally-ordered streams; merge each into a
    // single ascending run before validating.
    req1.sort_by_key(|io| io.offset);
    req2.sort_by_key(|io| io.offset);
    let req1 = coalesce_sorted(req1);
    let req2 = coalesce_sorted(req2);

    let bytes1 = validate_list(&req1);
    let bytes2 = validate_list(&req2);
    let original: u64 = iolist.iter().map(|io| io.len).sum();
    assert_eq!(
        original,
        bytes1 + bytes2,
        "split halves must cover the input exactly"
    );

    debug!(
        entries = iolist.len(),
        bytes = original,
        req1_entries = req1.len(),
        req1_bytes = bytes1,
        req2_entries = req2.len(),
        req2_bytes = bytes2,
        "Split vector read"
    );
    (req1, req2)
}

/// Adds `want` bytes at `offset` to the output, extending a contiguous back
/// entry up to the chunk cap before appending a fresh entry. Returns the
/// bytes actually placed.
fn push_or_coalesce(output: &mut Vec<IoSegment>, offset: u64, want: u64) -> u64 {
    if let Some(back) = output.last_mut() {
        if back.len < MAX_CHUNK && back.end() == offset {
            let take = want.min(MAX_CHUNK - back.len);
            back.len += take;
            return take;
        }
    }
    output.push(IoSegment::new(offset, want));
    want
}

/// Consumes up to `budget` bytes from the front of `input` into `output`.
fn consume_chunk_front(
    front: &mut usize,
    input: &mut [IoSegment],
    output: &mut Vec<IoSegment>,
    mut budget: u64,
) {
    while budget > 0 && *front < input.len() {
        let io = input[*front];
        if io.len > budget {
            let consumed = push_or_coalesce(output, io.offset, budget);
            budget -= consumed;
            let entry = &mut input[*front];
            entry.offset += consumed;
            entry.len -= consumed;
        } else if io.len == 0 {
            *front += 1;
        } else {
            output.push(io);
            budget -= io.len;
            *front += 1;
        }
    }
}

/// Consumes up to `budget` bytes from the back of `input` into `output`,
/// stopping at the `front` watermark.
fn consume_chunk_back(
    front: usize,
    input: &mut Vec<IoSegment>,
    output: &mut Vec<IoSegment>,
    mut budget: u64,
) {
    while budget > 0 && front < input.len() {
        let io = *input.last().expect("non-empty by loop condition");
        if io.len > budget {
            let consumed = push_or_coalesce(output, io.offset, budget);
            budget -= consumed;
            let entry = input.last_mut().expect("non-empty by loop condition");
            entry.offset += consumed;
            entry.len -= consumed;
        } else if io.len == 0 {
            input.pop();
        } else {
            output.push(io);
            budget -= io.len;
            input.pop();
        }
    }
}

/// Merges contiguous neighbours of a sorted list up to the chunk cap.
///
/// Pieces of one input entry peeled in different rounds end up adjacent only
/// after the sort, so a final pass is needed to deliver the no-unmerged-
/// neighbours guarantee.
fn coalesce_sorted(entries: Vec<IoSegment>) -> Vec<IoSegment> {
    let mut out: Vec<IoSegment> = Vec::with_capacity(entries.len());
    for mut io in entries {
        if let Some(back) = out.last_mut() {
            if back.len < MAX_CHUNK && back.end() == io.offset {
                let take = io.len.min(MAX_CHUNK - back.len);
                back.len += take;
                io.offset += take;
                io.len -= take;
                if io.len == 0 {
                    continue;
                }
            }
        }
        out.push(io);
    }
    out
}

/// Checks the split post-conditions on one half and returns its byte total.
fn validate_list(entries: &[IoSegment]) -> u64 {
    let mut total = 0u64;
    let mut last_offset: Option<u64> = None;
    for io in entries {
        total += io.len;
        if let Some(prev) = last_offset {
            assert!(io.offset > prev, "split output must be strictly offset-ascending");
        }
        last_offset = Some(io.offset);
        assert!(io.len <= MAX_CHUNK, "split output entry exceeds the chunk cap");
        assert!(io.offset < 0x1ff_ffff_ffff, "offset beyond the supported file size");
    }
    total
}
