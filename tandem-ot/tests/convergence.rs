//! Property tests for the transform engine.
//!
//! Random base documents and random operation pairs; every pair must
//! converge regardless of which side is applied first.

use proptest::prelude::*;
use proptest::test_runner::Config;
use tandem_ot::{compose, decode, encode, transform, transform_by_author, Operation};

/// Raw edit script: (kind, amount, text).
type Script = Vec<(u8, usize, String)>;

/// Build an operation against a document of `doc_len` chars from a script.
fn build_op(doc_len: usize, script: &Script) -> Operation {
    let mut op = Operation::new();
    let mut remaining = doc_len;
    for (kind, amount, text) in script {
        match kind % 3 {
            0 => {
                let n = (*amount).min(remaining);
                op.retain(n);
                remaining -= n;
            }
            1 => {
                op.insert(text);
            }
            _ => {
                let n = (*amount).min(remaining);
                op.delete(n);
                remaining -= n;
            }
        }
    }
    op.retain(remaining);
    op
}

fn doc_strategy() -> impl Strategy<Value = String> {
    "[a-eé☃ ]{0,24}"
}

fn script_strategy() -> impl Strategy<Value = Script> {
    prop::collection::vec((0u8..3, 0usize..6, "[x-zñ]{1,4}"), 0..8)
}

proptest! {
    #![proptest_config(Config::with_cases(512))]

    #[test]
    fn transform_converges(doc in doc_strategy(), sa in script_strategy(), sb in script_strategy()) {
        let len = doc.chars().count();
        let a = build_op(len, &sa);
        let b = build_op(len, &sb);

        let (a_prime, b_prime) = transform(&a, &b).unwrap();
        let left = b_prime.apply(&a.apply(&doc).unwrap()).unwrap();
        let right = a_prime.apply(&b.apply(&doc).unwrap()).unwrap();
        prop_assert_eq!(left, right);
    }

    #[test]
    fn author_ordered_transform_converges(
        doc in doc_strategy(),
        sa in script_strategy(),
        sb in script_strategy(),
        author_a in 0u8..4,
        author_b in 0u8..4,
    ) {
        let len = doc.chars().count();
        let a = build_op(len, &sa);
        let b = build_op(len, &sb);

        let (a_prime, b_prime) = transform_by_author(&a, &author_a, &b, &author_b).unwrap();
        let left = b_prime.apply(&a.apply(&doc).unwrap()).unwrap();
        let right = a_prime.apply(&b.apply(&doc).unwrap()).unwrap();
        prop_assert_eq!(left, right);
    }

    #[test]
    fn compose_matches_sequential_apply(doc in doc_strategy(), sa in script_strategy(), sb in script_strategy()) {
        let a = build_op(doc.chars().count(), &sa);
        let mid = a.apply(&doc).unwrap();
        let b = build_op(mid.chars().count(), &sb);

        let composed = compose(&a, &b).unwrap();
        prop_assert_eq!(composed.apply(&doc).unwrap(), b.apply(&mid).unwrap());
    }

    #[test]
    fn transformed_ops_compose_to_same_result(doc in doc_strategy(), sa in script_strategy(), sb in script_strategy()) {
        let len = doc.chars().count();
        let a = build_op(len, &sa);
        let b = build_op(len, &sb);
        let (a_prime, b_prime) = transform(&a, &b).unwrap();

        let ab = compose(&a, &b_prime).unwrap();
        let ba = compose(&b, &a_prime).unwrap();
        prop_assert_eq!(ab.apply(&doc).unwrap(), ba.apply(&doc).unwrap());
    }

    #[test]
    fn codec_preserves_effect(doc in doc_strategy(), sa in script_strategy()) {
        let op = build_op(doc.chars().count(), &sa);
        let decoded = decode(&encode(&op).unwrap()).unwrap();
        prop_assert_eq!(decoded.apply(&doc).unwrap(), op.apply(&doc).unwrap());
    }

    #[test]
    fn diff_rebuilds_target(old in doc_strategy(), new in doc_strategy()) {
        let op = Operation::diff(&old, &new);
        prop_assert_eq!(op.apply(&old).unwrap(), new);
    }
}
