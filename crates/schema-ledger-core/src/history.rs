use sha2::{Digest, Sha256};

use crate::{LogEntry, Sequence};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ContiguityError {
    #[error("log is missing sequence {expected}; next recorded sequence is {found}")]
    Gap { expected: Sequence, found: Sequence },
    #[error("log records sequence {found} out of order; expected {expected}")]
    OutOfOrder { expected: Sequence, found: Sequence },
}

/// Verify that `entries` (ordered by sequence) hold exactly `1..=N`.
///
/// # Errors
/// Returns [`ContiguityError`] describing the first gap, duplicate or reordering.
pub fn check_contiguous(entries: &[LogEntry]) -> Result<(), ContiguityError> {
    let mut expected = Sequence::FIRST;
    for entry in entries {
        if entry.sequence > expected {
            return Err(ContiguityError::Gap { expected, found: entry.sequence });
        }
        if entry.sequence < expected {
            return Err(ContiguityError::OutOfOrder { expected, found: entry.sequence });
        }
        match expected.next() {
            Some(next) => expected = next,
            None => break,
        }
    }
    Ok(())
}

/// SHA-256 over every `sequence \t text \n`, so environments can be compared for drift.
#[must_use]
pub fn history_fingerprint(entries: &[LogEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.sequence.to_string().as_bytes());
        hasher.update(b"\t");
        hasher.update(entry.text.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;

    fn entry(sequence: u32, text: &str) -> LogEntry {
        LogEntry {
            sequence: Sequence(sequence),
            text: text.to_string(),
            applied_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn contiguous_log_passes() {
        assert_eq!(check_contiguous(&[]), Ok(()));
        assert_eq!(check_contiguous(&[entry(1, "a"), entry(2, "b"), entry(3, "c")]), Ok(()));
    }

    #[test]
    fn gap_is_reported_at_the_first_missing_sequence() {
        assert_eq!(
            check_contiguous(&[entry(1, "a"), entry(3, "c")]),
            Err(ContiguityError::Gap { expected: Sequence(2), found: Sequence(3) })
        );
        assert_eq!(
            check_contiguous(&[entry(2, "b")]),
            Err(ContiguityError::Gap { expected: Sequence(1), found: Sequence(2) })
        );
    }

    #[test]
    fn duplicate_sequence_is_out_of_order() {
        assert_eq!(
            check_contiguous(&[entry(1, "a"), entry(1, "a")]),
            Err(ContiguityError::OutOfOrder { expected: Sequence(2), found: Sequence(1) })
        );
    }

    #[test]
    fn fingerprint_ignores_applied_at_but_not_text() {
        let mut later = entry(1, "CREATE TABLE a");
        later.applied_at = OffsetDateTime::UNIX_EPOCH + time::Duration::days(3);

        let base = history_fingerprint(&[entry(1, "CREATE TABLE a")]);
        assert_eq!(base, history_fingerprint(&[later]));
        assert_ne!(base, history_fingerprint(&[entry(1, "CREATE TABLE a ")]));
        assert_eq!(base.len(), 64);
    }
}
