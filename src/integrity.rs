//! Final check before export.
use crate::error::IntegrityViolation;
use crate::packet::Packet;

/// Verify a sorted export is duplicate-free and covers `1..=max` exactly.
///
/// This recomputes completeness from the packets themselves rather than
/// trusting the store's gap check.
pub fn verify(packets: &[Packet]) -> Result<(), IntegrityViolation> {
    let mut max = 0i32;
    let mut prev: Option<i32> = None;
    for p in packets {
        let seq = p.sequence();
        if prev.is_some_and(|last| seq <= last) {
            return Err(IntegrityViolation::DuplicateSequence { sequence: seq });
        }
        prev = Some(seq);
        max = max.max(seq);
    }
    let expected = max as usize;
    if packets.len() != expected {
        return Err(IntegrityViolation::CountMismatch { expected, actual: packets.len() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encode_frame;

    fn pkts(seqs: &[i32]) -> Vec<Packet> {
        seqs.iter()
            .map(|s| Packet::from_frame(&encode_frame(b"MSFT", b'S', 1, 1, *s)).unwrap())
            .collect()
    }

    #[test]
    fn accepts_complete_run() {
        assert!(verify(&pkts(&[1, 2, 3, 4])).is_ok());
        assert!(verify(&[]).is_ok());
    }

    #[test]
    fn flags_gap_with_counts() {
        let err = verify(&pkts(&[1, 2, 4])).unwrap_err();
        assert_eq!(err, IntegrityViolation::CountMismatch { expected: 4, actual: 3 });
    }

    #[test]
    fn flags_duplicate() {
        let err = verify(&pkts(&[1, 2, 2])).unwrap_err();
        assert_eq!(err, IntegrityViolation::DuplicateSequence { sequence: 2 });
    }
}
