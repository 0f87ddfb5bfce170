//! Descriptor properties: wire layout survives a parse, flag words are
//! lossless, and malformed input is always INVALID_PARAMETERS.

use ffa_memval::ffa::descriptors::*;
use ffa_memval::ffa::{FfaError, Handle, FFA_PAGE_SIZE};
use proptest::prelude::*;

fn constituent() -> impl Strategy<Value = Constituent> {
    (0u64..1 << 36, 1u32..64).prop_map(|(page, count)| Constituent::new(page * FFA_PAGE_SIZE as u64, count))
}

fn transfer_intent() -> impl Strategy<Value = MemRegionIntent> {
    (
        any::<u16>(),
        any::<u16>(),
        any::<u64>(),
        prop::collection::vec(constituent(), 1..40),
    )
        .prop_map(|(sender, receiver, tag, constituents)| MemRegionIntent {
            tag,
            ..MemRegionIntent::single_page(sender, receiver, 0).with_constituents(constituents)
        })
}

proptest! {
    #[test]
    fn test_transfer_parses_back(intent in transfer_intent()) {
        let mut buf = vec![0u8; FFA_PAGE_SIZE];
        let lengths = build_transfer(&intent, &mut buf).unwrap();
        prop_assert_eq!(
            lengths.total as usize,
            CONSTITUENTS_OFFSET + intent.constituents.len() * CONSTITUENT_SIZE
        );
        prop_assert_eq!(lengths.fragment, lengths.total);

        let parsed = parse_transaction(&buf[..lengths.total as usize]).unwrap();
        prop_assert!(parsed.has_composite);
        prop_assert_eq!(parsed.receiver_count, 1);
        prop_assert_eq!(parsed.region, intent);
    }

    #[test]
    fn test_truncated_transfer_is_invalid(intent in transfer_intent(), cut in 1usize..64) {
        let bytes = intent.encode(true);
        let len = bytes.len().saturating_sub(cut);
        prop_assert_eq!(parse_transaction(&bytes[..len]), Err(FfaError::InvalidParameters));
    }

    #[test]
    fn test_region_flags_are_lossless(raw in any::<u32>()) {
        prop_assert_eq!(u32::from(RegionFlags::from(raw)), raw);
    }

    #[test]
    fn test_alignment_hint_boundary(n in 1u8..10, addr in any::<u64>()) {
        let hint = AlignmentHint::Boundary(n);
        let boundary = (FFA_PAGE_SIZE as u64) << n;
        prop_assert_eq!(hint.boundary_bytes(), Some(boundary));
        prop_assert_eq!(hint.is_satisfied_by(addr), addr % boundary == 0);
        prop_assert!(hint.is_satisfied_by(addr - addr % boundary));
    }

    #[test]
    fn test_page_count_mismatch_is_invalid(intent in transfer_intent(), extra in 1u32..1000) {
        let mut bytes = intent.encode(true);
        let declared = intent.total_page_count().wrapping_add(extra);
        bytes[COMPOSITE_OFFSET..COMPOSITE_OFFSET + 4].copy_from_slice(&declared.to_le_bytes());
        prop_assert_eq!(parse_transaction(&bytes), Err(FfaError::InvalidParameters));
    }
}

#[test]
fn test_unspecified_hints_accept_any_address() {
    assert!(AlignmentHint::None.is_satisfied_by(0x1234_5000));
    assert!(AlignmentHint::Boundary(0).is_satisfied_by(0x1234_5000));
    assert!(AlignmentHint::Reserved(3).is_satisfied_by(0x1234_5000));
}

#[test]
fn test_oversized_transfer_reports_both_sizes() {
    let intent = MemRegionIntent::single_page(0x8001, 0x8002, 0).with_constituents(
        (0..255)
            .map(|i| Constituent::new(i * 2 * FFA_PAGE_SIZE as u64, 1))
            .collect(),
    );
    // 80 + 255 * 16 = 4160
    let mut buf = vec![0u8; FFA_PAGE_SIZE];
    assert_eq!(
        build_transfer(&intent, &mut buf),
        Err(BuildError::ExceedsBuffer {
            needed: 4160,
            available: FFA_PAGE_SIZE
        })
    );
    let mut two_pages = vec![0u8; 2 * FFA_PAGE_SIZE];
    assert!(build_transfer(&intent, &mut two_pages).is_ok());
}

#[test]
fn test_reserved_header_bytes_are_invalid() {
    let mut bytes = MemRegionIntent::single_page(0x8001, 0x8002, 0x8000_0000).encode(true);
    bytes[MEM_REGION_SIZE - 1] = 1;
    assert_eq!(parse_transaction(&bytes), Err(FfaError::InvalidParameters));
}

#[test]
fn test_peek_header_ignores_the_body() {
    let mut intent = MemRegionIntent::single_page(0x8001, 0x8002, 0x8000_0000);
    intent.handle = Handle(0xDEAD_0000_BEEF);
    intent.flags = RegionFlags::with_type(TransactionType::Lend);
    let bytes = intent.encode(true);
    let (handle, flags) = peek_header(&bytes[..MEM_REGION_SIZE]).unwrap();
    assert_eq!(handle, Handle(0xDEAD_0000_BEEF));
    assert_eq!(flags.transaction_type, TransactionType::Lend);
}

#[test]
fn test_relinquish_with_missing_endpoints_is_invalid() {
    let mut buf = [0u8; 64];
    build_relinquish(Handle(5), 0, &[0x8001, 0x8002], &mut buf).unwrap();
    // Claims two endpoints, carries one
    assert_eq!(
        parse_relinquish(&buf[..RELINQUISH_SIZE + 2]),
        Err(FfaError::InvalidParameters)
    );
}
