use mini_voron_common::StorageError;

/// Each record is `offset: u64`, `len: i64`, then `len` bytes when positive.
const RECORD_HEADER_SIZE: usize = 16;

/// Equal-byte gap below which adjacent differing runs are merged into one
/// record, so scattered small edits don't pay a 16-byte header each.
const MERGE_GAP: usize = 16;

/// Apply a compact page diff onto `destination` in place.
///
/// The diff is a sequence of records: `offset` (u64 LE), `len` (i64 LE),
/// followed by `len` literal bytes when `len > 0`, or nothing when `len < 0`
/// (a run of `-len` zero bytes). Pure and allocation-free; must stay
/// bit-compatible with [`compute_diff`].
///
/// A record that writes past `destination`, a truncated record, or a
/// zero-length record is reported as [`StorageError::MalformedDiff`]: the
/// journal that carried it is corrupt.
pub fn apply_diff(destination: &mut [u8], diff: &[u8]) -> Result<(), StorageError> {
    let mut pos = 0usize;
    while pos < diff.len() {
        if diff.len() - pos < RECORD_HEADER_SIZE {
            return Err(StorageError::MalformedDiff(format!(
                "truncated record header at byte {pos}"
            )));
        }
        let offset = u64::from_le_bytes(diff[pos..pos + 8].try_into().unwrap()) as usize;
        let len = i64::from_le_bytes(diff[pos + 8..pos + 16].try_into().unwrap());
        pos += RECORD_HEADER_SIZE;

        if len == 0 {
            return Err(StorageError::MalformedDiff(format!(
                "zero-length record at byte {}",
                pos - RECORD_HEADER_SIZE
            )));
        }

        let run_len = len.unsigned_abs() as usize;
        let end = match offset.checked_add(run_len) {
            Some(end) if end <= destination.len() => end,
            _ => {
                return Err(StorageError::MalformedDiff(format!(
                    "record writes past the destination (offset {offset}, len {len}, destination {})",
                    destination.len()
                )));
            }
        };

        if len > 0 {
            if diff.len() - pos < run_len {
                return Err(StorageError::MalformedDiff(format!(
                    "record body truncated at byte {pos} (need {run_len} bytes)"
                )));
            }
            destination[offset..end].copy_from_slice(&diff[pos..pos + run_len]);
            pos += run_len;
        } else {
            destination[offset..end].fill(0);
        }
    }
    Ok(())
}

/// Compute the diff that turns `old` into `new`.
///
/// Deterministic: identical inputs always produce identical bytes, which is
/// what makes re-running a recovery pass idempotent. Returns `None` when a
/// diff would not beat storing the image verbatim (including the
/// identical-images case, since an empty diff is indistinguishable from the
/// verbatim marker on disk).
pub fn compute_diff(old: &[u8], new: &[u8]) -> Option<Vec<u8>> {
    if old.len() != new.len() {
        return None;
    }

    let len = new.len();
    let mut out = Vec::new();
    let mut i = 0;
    while i < len {
        if old[i] == new[i] {
            i += 1;
            continue;
        }

        // Extend the run across gaps of up to MERGE_GAP equal bytes.
        let start = i;
        let mut last_diff = i;
        i += 1;
        while i < len && i - last_diff <= MERGE_GAP {
            if old[i] != new[i] {
                last_diff = i;
            }
            i += 1;
        }

        let run = &new[start..=last_diff];
        out.extend_from_slice(&(start as u64).to_le_bytes());
        if run.iter().all(|&b| b == 0) {
            out.extend_from_slice(&(-(run.len() as i64)).to_le_bytes());
        } else {
            out.extend_from_slice(&(run.len() as i64).to_le_bytes());
            out.extend_from_slice(run);
        }

        if out.len() >= len {
            return None;
        }
    }

    if out.is_empty() {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(old: &[u8], new: &[u8]) -> Vec<u8> {
        let diff = compute_diff(old, new).expect("diff should be profitable");
        let mut image = old.to_vec();
        apply_diff(&mut image, &diff).unwrap();
        image
    }

    #[test]
    fn test_roundtrip_single_window() {
        let old = vec![0xAA; 8192];
        let mut new = old.clone();
        for b in &mut new[100..116] {
            *b = 0xCC;
        }
        assert_eq!(roundtrip(&old, &new), new);
    }

    #[test]
    fn test_roundtrip_scattered_edits() {
        let old: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let mut new = old.clone();
        new[0] = 0xFF;
        new[17] = 0xFE; // 17 bytes from the previous edit, past MERGE_GAP
        new[4000] = 0x01;
        new[4001] = 0x02;
        new[8191] = 0x7F;
        assert_eq!(roundtrip(&old, &new), new);
    }

    #[test]
    fn test_zero_run_encoding() {
        let old = vec![0xEE; 4096];
        let mut new = old.clone();
        for b in &mut new[512..1024] {
            *b = 0;
        }
        let diff = compute_diff(&old, &new).unwrap();
        // One record, no literal bytes: just offset + negative length.
        assert_eq!(diff.len(), 16);
        let len = i64::from_le_bytes(diff[8..16].try_into().unwrap());
        assert_eq!(len, -512);

        let mut image = old.clone();
        apply_diff(&mut image, &diff).unwrap();
        assert_eq!(image, new);
    }

    #[test]
    fn test_nearby_edits_merge_into_one_record() {
        let old = vec![0u8; 4096];
        let mut new = old.clone();
        new[100] = 1;
        new[110] = 2; // 10 equal bytes in between, below MERGE_GAP
        let diff = compute_diff(&old, &new).unwrap();
        let len = i64::from_le_bytes(diff[8..16].try_into().unwrap());
        assert_eq!(len, 11);
        assert_eq!(diff.len(), 16 + 11);
    }

    #[test]
    fn test_identical_images_fall_back_to_verbatim() {
        let image = vec![0x42; 4096];
        assert!(compute_diff(&image, &image).is_none());
    }

    #[test]
    fn test_unprofitable_diff_falls_back_to_verbatim() {
        let old = vec![0x00u8; 4096];
        let new = vec![0x01u8; 4096];
        assert!(compute_diff(&old, &new).is_none());
    }

    #[test]
    fn test_mismatched_lengths_fall_back_to_verbatim() {
        assert!(compute_diff(&[0u8; 100], &[0u8; 200]).is_none());
    }

    #[test]
    fn test_apply_rejects_truncated_header() {
        let mut dest = vec![0u8; 64];
        let err = apply_diff(&mut dest, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, StorageError::MalformedDiff(_)));
    }

    #[test]
    fn test_apply_rejects_truncated_body() {
        let mut diff = Vec::new();
        diff.extend_from_slice(&0u64.to_le_bytes());
        diff.extend_from_slice(&8i64.to_le_bytes());
        diff.extend_from_slice(&[0xAB; 4]); // promises 8 bytes, carries 4
        let mut dest = vec![0u8; 64];
        assert!(matches!(
            apply_diff(&mut dest, &diff),
            Err(StorageError::MalformedDiff(_))
        ));
    }

    #[test]
    fn test_apply_rejects_out_of_bounds_offset() {
        let mut diff = Vec::new();
        diff.extend_from_slice(&60u64.to_le_bytes());
        diff.extend_from_slice(&8i64.to_le_bytes());
        diff.extend_from_slice(&[0xAB; 8]);
        let mut dest = vec![0u8; 64];
        assert!(matches!(
            apply_diff(&mut dest, &diff),
            Err(StorageError::MalformedDiff(_))
        ));
    }

    #[test]
    fn test_apply_rejects_zero_length_record() {
        let mut diff = Vec::new();
        diff.extend_from_slice(&0u64.to_le_bytes());
        diff.extend_from_slice(&0i64.to_le_bytes());
        let mut dest = vec![0u8; 64];
        assert!(matches!(
            apply_diff(&mut dest, &diff),
            Err(StorageError::MalformedDiff(_))
        ));
    }
}
