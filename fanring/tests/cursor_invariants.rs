//! Randomized producer/reader interleavings, checking the cursor algebra
//! stays inside its legal envelope after every step.

use fanring::{Cursor, Ring};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Produce(usize),
    Read(usize, usize),
    Reattach(usize),
}

const READERS: usize = 3;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1usize..128).prop_map(Op::Produce),
        4 => (0..READERS, 0usize..128).prop_map(|(r, n)| Op::Read(r, n)),
        1 => (0..READERS).prop_map(Op::Reattach),
    ]
}

fn check(ring: &Ring, cursor: &Cursor) -> Result<(), TestCaseError> {
    prop_assert!(cursor.lap() <= ring.lap());
    prop_assert!(cursor.lap() + 1 >= ring.lap());
    if cursor.lap() == ring.lap() {
        prop_assert!(cursor.pos() <= ring.head());
    } else {
        prop_assert!(cursor.pos() >= ring.head());
    }
    prop_assert!(cursor.pos() < ring.capacity());
    prop_assert!(ring.readable(cursor).len() <= ring.capacity());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn cursors_stay_legal(
        capacity in 1usize..48,
        ops in proptest::collection::vec(op_strategy(), 1..200),
    ) {
        let mut ring = Ring::new(capacity).unwrap();
        let mut cursors: Vec<Cursor> = (0..READERS).map(|_| ring.attach()).collect();

        for op in ops {
            match op {
                Op::Produce(n) => {
                    let window = ring.reserve();
                    let n = n.min(window.len());
                    for byte in window[..n].iter_mut() {
                        *byte = 0xA5;
                    }
                    ring.commit(n, cursors.iter_mut());
                }
                Op::Read(r, n) => {
                    let n = n.min(ring.readable(&cursors[r]).len());
                    ring.advance(&mut cursors[r], n);
                }
                Op::Reattach(r) => cursors[r] = ring.attach(),
            }
            for cursor in &cursors {
                check(&ring, cursor)?;
            }
        }
    }

    #[test]
    fn lapped_readers_never_see_more_than_one_buffer(
        capacity in 1usize..32,
        chunks in proptest::collection::vec(1usize..64, 1..64),
    ) {
        let mut ring = Ring::new(capacity).unwrap();
        let mut cursor = ring.attach();
        for chunk in chunks {
            let mut left = chunk;
            while left > 0 {
                let window = ring.reserve();
                let n = left.min(window.len());
                ring.commit(n, [&mut cursor]);
                left -= n;
            }
            prop_assert!(ring.readable(&cursor).len() <= capacity);
            check(&ring, &cursor)?;
        }
    }
}
