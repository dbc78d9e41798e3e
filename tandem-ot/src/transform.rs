//! Transform and compose.
//!
//! `transform(a, b)` takes two operations generated against the same base
//! document and returns `(a', b')` such that
//!
//! ```text
//! apply(apply(doc, a), b') == apply(apply(doc, b), a')
//! ```
//!
//! ## Tie-break
//!
//! When both operations insert at the same position, the *left* argument's
//! text is placed first. The sequencer always passes the operation it
//! applied earlier as the left argument, so concurrent inserts end up in
//! sequencer arrival order. That order is total and every replica learns it
//! from the server, which keeps all replicas consistent.
//! [`transform_by_author`] offers an author-ordered variant for callers
//! without a central sequencer.

use crate::error::OtError;
use crate::operation::{char_len, split_chars, Component, Operation};

/// Transform two concurrent operations. Inserts from `a` win ties.
pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
    if a.base_len() != b.base_len() {
        return Err(OtError::BaseLengthMismatch {
            left: a.base_len(),
            right: b.base_len(),
        });
    }

    let mut a_prime = Operation::new();
    let mut b_prime = Operation::new();

    let mut iter_a = a.components().iter().cloned();
    let mut iter_b = b.components().iter().cloned();
    let mut ca = iter_a.next();
    let mut cb = iter_b.next();

    loop {
        match (ca.take(), cb.take()) {
            (None, None) => break,

            // Inserts never consume each other; `a` goes first on ties.
            (Some(Component::Insert(text)), other) => {
                b_prime.retain(char_len(&text));
                a_prime.insert(&text);
                ca = iter_a.next();
                cb = other;
            }
            (other, Some(Component::Insert(text))) => {
                a_prime.retain(char_len(&text));
                b_prime.insert(&text);
                ca = other;
                cb = iter_b.next();
            }

            (None, Some(_)) | (Some(_), None) => {
                return Err(OtError::BaseLengthMismatch {
                    left: a.base_len(),
                    right: b.base_len(),
                });
            }

            (Some(Component::Retain(x)), Some(Component::Retain(y))) => {
                let n = x.min(y);
                a_prime.retain(n);
                b_prime.retain(n);
                ca = remainder(Component::Retain(x), n, &mut iter_a);
                cb = remainder(Component::Retain(y), n, &mut iter_b);
            }
            // Overlapping deletes: the range is already gone on both sides.
            (Some(Component::Delete(x)), Some(Component::Delete(y))) => {
                let n = x.min(y);
                ca = remainder(Component::Delete(x), n, &mut iter_a);
                cb = remainder(Component::Delete(y), n, &mut iter_b);
            }
            (Some(Component::Delete(x)), Some(Component::Retain(y))) => {
                let n = x.min(y);
                a_prime.delete(n);
                ca = remainder(Component::Delete(x), n, &mut iter_a);
                cb = remainder(Component::Retain(y), n, &mut iter_b);
            }
            (Some(Component::Retain(x)), Some(Component::Delete(y))) => {
                let n = x.min(y);
                b_prime.delete(n);
                ca = remainder(Component::Retain(x), n, &mut iter_a);
                cb = remainder(Component::Delete(y), n, &mut iter_b);
            }
        }
    }

    Ok((a_prime, b_prime))
}

/// Transform with the tie-break decided by author order: the lower author
/// id places its insert first. Equal authors fall back to argument order.
pub fn transform_by_author<A: Ord>(
    a: &Operation,
    author_a: &A,
    b: &Operation,
    author_b: &A,
) -> Result<(Operation, Operation), OtError> {
    if author_a <= author_b {
        transform(a, b)
    } else {
        let (b_prime, a_prime) = transform(b, a)?;
        Ok((a_prime, b_prime))
    }
}

/// Combine two sequential operations into one: `apply(apply(d, a), b) ==
/// apply(d, compose(a, b))`.
pub fn compose(a: &Operation, b: &Operation) -> Result<Operation, OtError> {
    if a.target_len() != b.base_len() {
        return Err(OtError::ComposeLengthMismatch {
            first: a.target_len(),
            second: b.base_len(),
        });
    }

    let mut out = Operation::new();
    let mut iter_a = a.components().iter().cloned();
    let mut iter_b = b.components().iter().cloned();
    let mut ca = iter_a.next();
    let mut cb = iter_b.next();

    loop {
        match (ca.take(), cb.take()) {
            (None, None) => break,

            (Some(Component::Delete(n)), other) => {
                out.delete(n);
                ca = iter_a.next();
                cb = other;
            }
            (other, Some(Component::Insert(text))) => {
                out.insert(&text);
                ca = other;
                cb = iter_b.next();
            }

            (None, Some(_)) | (Some(_), None) => {
                return Err(OtError::ComposeLengthMismatch {
                    first: a.target_len(),
                    second: b.base_len(),
                });
            }

            (Some(Component::Retain(x)), Some(Component::Retain(y))) => {
                let n = x.min(y);
                out.retain(n);
                ca = remainder(Component::Retain(x), n, &mut iter_a);
                cb = remainder(Component::Retain(y), n, &mut iter_b);
            }
            (Some(Component::Retain(x)), Some(Component::Delete(y))) => {
                let n = x.min(y);
                out.delete(n);
                ca = remainder(Component::Retain(x), n, &mut iter_a);
                cb = remainder(Component::Delete(y), n, &mut iter_b);
            }
            (Some(Component::Insert(text)), Some(Component::Retain(y))) => {
                let len = char_len(&text);
                let n = len.min(y);
                let (head, tail) = split_chars(&text, n);
                out.insert(head);
                ca = if tail.is_empty() {
                    iter_a.next()
                } else {
                    Some(Component::Insert(tail.to_string()))
                };
                cb = remainder(Component::Retain(y), n, &mut iter_b);
            }
            // Text inserted by `a` and deleted by `b` never existed.
            (Some(Component::Insert(text)), Some(Component::Delete(y))) => {
                let len = char_len(&text);
                let n = len.min(y);
                let (_, tail) = split_chars(&text, n);
                ca = if tail.is_empty() {
                    iter_a.next()
                } else {
                    Some(Component::Insert(tail.to_string()))
                };
                cb = remainder(Component::Delete(y), n, &mut iter_b);
            }
        }
    }

    Ok(out)
}

/// Move a cursor index through `op`.
///
/// Text inserted exactly at the cursor pushes it right; a deleted range
/// containing the cursor collapses it to the start of the range.
pub fn transform_index(op: &Operation, index: usize) -> usize {
    let mut new_index = index;
    let mut pos = 0usize;
    for component in op.components() {
        if pos > index {
            break;
        }
        match component {
            Component::Retain(n) => pos += n,
            Component::Insert(text) => new_index += char_len(text),
            Component::Delete(n) => {
                new_index -= (index - pos).min(*n);
                pos += n;
            }
        }
    }
    new_index
}

/// Consume `n` units of a retain/delete segment, returning what is left or
/// the next segment when it is used up.
fn remainder<I>(component: Component, n: usize, iter: &mut I) -> Option<Component>
where
    I: Iterator<Item = Component>,
{
    match component {
        Component::Retain(x) if x > n => Some(Component::Retain(x - n)),
        Component::Delete(x) if x > n => Some(Component::Delete(x - n)),
        _ => iter.next(),
    }
}
