//! Retain / insert / delete operations over a sequence of chars.
//!
//! Operations are always kept in normalized form:
//! - no zero-length segments
//! - adjacent segments of the same kind are merged
//! - an insert next to a delete is stored insert-first
//!
//! so two operations that describe the same edit compare equal.

use std::fmt;

use crate::error::OtError;

/// A single segment of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    /// Keep `n` chars of the base document.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove `n` chars of the base document.
    Delete(usize),
}

impl Component {
    /// Number of chars this segment spans in its own dimension
    /// (base chars for retain/delete, inserted chars for insert).
    pub fn len(&self) -> usize {
        match self {
            Component::Retain(n) | Component::Delete(n) => *n,
            Component::Insert(text) => char_len(text),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An immutable-once-built edit over a base document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Operation {
    components: Vec<Component>,
    /// Chars consumed from the base document (retain + delete).
    base_len: usize,
    /// Chars in the resulting document (retain + insert).
    target_len: usize,
}

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a normalized operation from raw segments.
    pub fn from_components<I>(components: I) -> Self
    where
        I: IntoIterator<Item = Component>,
    {
        let mut op = Self::new();
        for component in components {
            op.push(component);
        }
        op
    }

    /// Insert `text` at `pos` in a document of `doc_len` chars.
    pub fn insert_at(doc_len: usize, pos: usize, text: &str) -> Result<Self, OtError> {
        if pos > doc_len {
            return Err(OtError::Malformed(format!(
                "insert position {pos} past end of {doc_len}-char document"
            )));
        }
        let mut op = Self::new();
        op.retain(pos).insert(text).retain(doc_len - pos);
        Ok(op)
    }

    /// Delete `count` chars starting at `pos` in a document of `doc_len` chars.
    pub fn delete_at(doc_len: usize, pos: usize, count: usize) -> Result<Self, OtError> {
        if pos.checked_add(count).map_or(true, |end| end > doc_len) {
            return Err(OtError::Malformed(format!(
                "delete range {pos}+{count} past end of {doc_len}-char document"
            )));
        }
        let mut op = Self::new();
        op.retain(pos).delete(count).retain(doc_len - pos - count);
        Ok(op)
    }

    /// The identity operation on a document of `doc_len` chars.
    pub fn identity(doc_len: usize) -> Self {
        let mut op = Self::new();
        op.retain(doc_len);
        op
    }

    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Retain(n));
        }
        self
    }

    pub fn insert(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        self.target_len += char_len(text);

        if let Some(Component::Insert(last)) = self.components.last_mut() {
            last.push_str(text);
            return self;
        }

        let len = self.components.len();
        if matches!(self.components.last(), Some(Component::Delete(_))) {
            // Keep inserts ahead of deletes: "delete 2, insert x" and
            // "insert x, delete 2" are the same edit.
            if len >= 2 {
                if let Component::Insert(prev) = &mut self.components[len - 2] {
                    prev.push_str(text);
                    return self;
                }
            }
            self.components
                .insert(len - 1, Component::Insert(text.to_string()));
        } else {
            self.components.push(Component::Insert(text.to_string()));
        }
        self
    }

    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        if let Some(Component::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Delete(n));
        }
        self
    }

    /// Append a raw segment, normalizing as it goes.
    pub fn push(&mut self, component: Component) -> &mut Self {
        match component {
            Component::Retain(n) => self.retain(n),
            Component::Insert(text) => self.insert(&text),
            Component::Delete(n) => self.delete(n),
        }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn base_len(&self) -> usize {
        self.base_len
    }

    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// True when applying the operation leaves any document unchanged.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Total chars inserted by this operation.
    pub fn inserted_len(&self) -> usize {
        self.components
            .iter()
            .map(|c| match c {
                Component::Insert(text) => char_len(text),
                _ => 0,
            })
            .sum()
    }

    /// Apply the operation to `doc`, producing the new document.
    pub fn apply(&self, doc: &str) -> Result<String, OtError> {
        let actual = char_len(doc);
        if actual != self.base_len {
            return Err(OtError::ApplyLengthMismatch {
                expected: self.base_len,
                actual,
            });
        }

        let mut out = String::with_capacity(doc.len() + self.inserted_len());
        let mut chars = doc.chars();
        for component in &self.components {
            match component {
                Component::Retain(n) => out.extend(chars.by_ref().take(*n)),
                Component::Insert(text) => out.push_str(text),
                Component::Delete(n) => {
                    for _ in 0..*n {
                        chars.next();
                    }
                }
            }
        }
        Ok(out)
    }

    /// Compute an operation turning `old` into `new`.
    ///
    /// Only the common prefix and suffix are preserved; everything in between
    /// is replaced. Good enough to rebase pending edits across a history gap.
    pub fn diff(old: &str, new: &str) -> Self {
        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();

        let prefix = old_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
        let suffix = old_chars
            .iter()
            .rev()
            .zip(new_chars.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
        let mut op = Self::new();
        op.retain(prefix)
            .delete(old_chars.len() - prefix - suffix)
            .insert(&inserted)
            .retain(suffix);
        op
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "noop");
        }
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match component {
                Component::Retain(n) => write!(f, "retain({n})")?,
                Component::Insert(text) => write!(f, "insert({text:?})")?,
                Component::Delete(n) => write!(f, "delete({n})")?,
            }
        }
        Ok(())
    }
}

/// Length of `text` in chars (the unit every operation counts in).
pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split `text` after `n` chars.
pub(crate) fn split_chars(text: &str, n: usize) -> (&str, &str) {
    match text.char_indices().nth(n) {
        Some((idx, _)) => text.split_at(idx),
        None => (text, ""),
    }
}
