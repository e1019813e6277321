use crate::units::{Bytes, Megabytes, StoreBlocks, StripeBlocks};

#[test]
fn scales_match_cache_geometry() {
    assert_eq!(StoreBlocks::SCALE, 8192);
    assert_eq!(StripeBlocks::SCALE, 128 * 1024 * 1024);
    assert_eq!(StripeBlocks::STORE_BLOCKS, 16384);
    assert_eq!(Megabytes::SCALE, 1 << 20);
}

#[test]
fn units_are_exact_multiplications() {
    assert_eq!(StoreBlocks::new(3).units(), 24576);
    assert_eq!(StripeBlocks::new(2).units(), 256 * 1024 * 1024);
    assert_eq!(StoreBlocks::new(5).to_bytes(), Bytes::new(40960));
}

#[test]
fn round_up_and_down_bracket_a_byte_count() {
    let b = Bytes::new(8193);
    assert_eq!(StoreBlocks::round_up(b), StoreBlocks::new(2));
    assert_eq!(StoreBlocks::round_down(b), StoreBlocks::new(1));

    let exact = Bytes::new(16384);
    assert_eq!(StoreBlocks::round_up(exact), StoreBlocks::new(2));
    assert_eq!(StoreBlocks::round_down(exact), StoreBlocks::new(2));

    assert_eq!(StripeBlocks::round_up(Bytes::new(1)), StripeBlocks::new(1));
    assert_eq!(StripeBlocks::round_down(Bytes::new(1)), StripeBlocks::new(0));
}

#[test]
fn arithmetic_preserves_scale() {
    let mut n = StoreBlocks::new(10);
    n += StoreBlocks::new(5);
    n -= StoreBlocks::new(3);
    assert_eq!(n, StoreBlocks::new(12));
    assert_eq!(n + StoreBlocks::new(1), StoreBlocks::new(13));
    assert!(StoreBlocks::new(2) < StoreBlocks::new(3));
}

#[test]
fn stripe_blocks_convert_to_store_blocks() {
    assert_eq!(
        StripeBlocks::new(3).to_store_blocks(),
        StoreBlocks::new(3 * 16384)
    );
}

#[test]
fn display_uses_scale_labels() {
    assert_eq!(StoreBlocks::new(4).to_string(), "4 store blocks");
    assert_eq!(StripeBlocks::new(1).to_string(), "1 stripe blocks");
    assert_eq!(Bytes::new(9).to_string(), "9 bytes");
}
