//! Property-based tests: both bitmap backends behave like a plain set

use ext2fs_rs::{BackendType, Bitmap};
use proptest::prelude::*;
use std::collections::BTreeSet;

const START: u64 = 1;
const END: u64 = 700;
const REAL_END: u64 = 767;

#[derive(Debug, Clone)]
enum Op {
    Mark(u64),
    Unmark(u64),
    MarkRange(u64, u64),
    UnmarkRange(u64, u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (START..=END).prop_map(Op::Mark),
        (START..=END).prop_map(Op::Unmark),
        (START..=END, 0u64..80).prop_map(|(i, n)| Op::MarkRange(i, n.min(END - i + 1))),
        (START..=END, 0u64..80).prop_map(|(i, n)| Op::UnmarkRange(i, n.min(END - i + 1))),
    ]
}

fn bitmap(backend: BackendType) -> Bitmap {
    Bitmap::new(
        ext2fs_rs::Magic::BlockBitmap,
        backend,
        START,
        END,
        REAL_END,
        "prop",
    )
    .unwrap()
}

fn apply(map: &mut Bitmap, model: &mut BTreeSet<u64>, op: &Op) {
    match *op {
        Op::Mark(i) => {
            let was = map.mark(i).unwrap();
            assert_eq!(was, !model.insert(i));
        }
        Op::Unmark(i) => {
            let was = map.unmark(i).unwrap();
            assert_eq!(was, model.remove(&i));
        }
        Op::MarkRange(i, n) => {
            map.mark_range(i, n).unwrap();
            model.extend(i..i + n);
        }
        Op::UnmarkRange(i, n) => {
            map.unmark_range(i, n).unwrap();
            for b in i..i + n {
                model.remove(&b);
            }
        }
    }
}

proptest! {
    #[test]
    fn prop_backends_agree_with_model(ops in prop::collection::vec(op(), 1..60)) {
        let mut flat = bitmap(BackendType::BitArray);
        let mut tree = bitmap(BackendType::RbTree);
        let mut model = BTreeSet::new();

        for op in &ops {
            apply(&mut flat, &mut model.clone(), op);
            apply(&mut tree, &mut model, op);
        }

        prop_assert_eq!(flat.count_set(), model.len() as u64);
        prop_assert_eq!(tree.count_set(), model.len() as u64);
        prop_assert!(flat.compare(&tree).unwrap().is_equal());

        for i in START..=END {
            prop_assert_eq!(tree.test(i).unwrap(), model.contains(&i));
        }

        let first_set = model.iter().next().copied();
        prop_assert_eq!(flat.find_first_set(START, END).unwrap(), first_set);
        prop_assert_eq!(tree.find_first_set(START, END).unwrap(), first_set);

        let first_zero = (START..=END).find(|i| !model.contains(i));
        prop_assert_eq!(flat.find_first_zero(START, END).unwrap(), first_zero);
        prop_assert_eq!(tree.find_first_zero(START, END).unwrap(), first_zero);
    }

    #[test]
    fn prop_merge_is_union(
        left in prop::collection::btree_set(START..=END, 0..120),
        right in prop::collection::btree_set(START..=END, 0..120),
    ) {
        for backend in [BackendType::BitArray, BackendType::RbTree] {
            let mut dest = bitmap(backend);
            let mut src = bitmap(BackendType::RbTree);
            for &i in &left {
                dest.mark(i).unwrap();
            }
            for &i in &right {
                src.mark(i).unwrap();
            }

            src.merge_into(&mut dest, None).unwrap();

            let union: BTreeSet<u64> = left.union(&right).copied().collect();
            prop_assert_eq!(dest.count_set(), union.len() as u64);
            for &i in &union {
                prop_assert!(dest.test(i).unwrap());
            }
        }
    }

    #[test]
    fn prop_range_export_matches_bits(
        bits in prop::collection::btree_set(START..=REAL_END, 0..200),
        from in START..=END,
        len in 0u64..64,
    ) {
        let len = len.min(REAL_END - from + 1);
        let mut flat = bitmap(BackendType::BitArray);
        flat.set_range(START, REAL_END - START + 1, &{
            let mut raw = vec![0u8; ((REAL_END - START + 1) as usize).div_ceil(8)];
            for &b in &bits {
                let off = (b - START) as usize;
                raw[off / 8] |= 1 << (off % 8);
            }
            raw
        }).unwrap();
        let tree = {
            let mut t = bitmap(BackendType::RbTree);
            let mut raw = vec![0u8; ((REAL_END - START + 1) as usize).div_ceil(8)];
            flat.get_range(START, REAL_END - START + 1, &mut raw).unwrap();
            t.set_range(START, REAL_END - START + 1, &raw).unwrap();
            t
        };

        let mut a = vec![0u8; (len as usize).div_ceil(8)];
        let mut b = vec![0u8; (len as usize).div_ceil(8)];
        flat.get_range(from, len, &mut a).unwrap();
        tree.get_range(from, len, &mut b).unwrap();
        prop_assert_eq!(&a, &b);

        for k in 0..len {
            let expected = bits.contains(&(from + k));
            let got = (a[(k / 8) as usize] >> (k % 8)) & 1 == 1;
            prop_assert_eq!(got, expected);
        }
    }
}

#[test]
fn test_range_checks_are_backend_independent() {
    for backend in [BackendType::BitArray, BackendType::RbTree] {
        let mut map = bitmap(backend);
        assert!(map.mark(0).is_err());
        assert!(map.mark(END + 1).is_err());
        assert!(map.mark_range(END, 2).is_err());
        // Padding past the logical end is reachable through raw ranges only
        let raw = [0xffu8; 9];
        map.set_range(END + 1, REAL_END - END, &raw).unwrap();
        assert_eq!(map.count_set(), 0);
    }
}
