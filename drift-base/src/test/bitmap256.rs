use crate::{Bitmap256, DoubleBitmap256};
use test_log::test;

#[test]
fn test_count_tracks_set_bits() {
    let mut bm = Bitmap256::new();
    for i in 0..=255 {
        bm.set(i, true);
        assert_eq!(bm.count(), i as u32 + 1);
    }
    assert!(bm.is_full());
    for i in 0..=127 {
        bm.set(i * 2, false);
    }
    assert_eq!(bm.count(), 128);
}

#[test]
fn test_double_bitmap() {
    let mut bm = DoubleBitmap256::new();

    let mut state = 1234;

    fn lcg_rand_step(state: &mut u32) {
        *state = (*state as u64 * 279470273u64 % 0xfffffffb) as u32;
    }

    for _i in 0..256_u32 {
        lcg_rand_step(&mut state);
        let i = state % 256;
        lcg_rand_step(&mut state);
        let val = state & 3;
        bm.set(i as u8, val as u8);
        assert_eq!(bm.get(i as u8), val as u8);
    }
}
