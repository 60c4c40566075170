//! Compact invalidation tag sets
//!
//! Most entries carry zero or one tag; the representation avoids an array
//! allocation for those cases. Multi-tag sets are sorted so the wire encoding
//! is canonical regardless of caller ordering.

use std::sync::Arc;

use crate::cache::types::{CacheError, CacheResult};

/// Reserved tag meaning "invalidate everything". Never valid as an entry tag.
pub const WILDCARD_TAG: &str = "*";

#[derive(Debug, Clone, Default)]
pub enum TagSet {
    #[default]
    Empty,
    One(Arc<str>),
    Many(Arc<[Arc<str>]>),
}

impl TagSet {
    /// Builds a tag set from caller input, rejecting empty tags, control
    /// characters and the reserved wildcard.
    pub fn new<I, S>(tags: I) -> CacheResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut collected: Vec<Arc<str>> = Vec::new();
        for tag in tags {
            let tag = tag.as_ref();
            validate_entry_tag(tag)?;
            collected.push(Arc::from(tag));
        }
        Ok(Self::from_vec(collected))
    }

    /// Canonicalizes an already-validated tag list (wire decode path).
    pub(crate) fn from_vec(mut tags: Vec<Arc<str>>) -> Self {
        match tags.len() {
            0 => TagSet::Empty,
            1 => TagSet::One(tags.remove(0)),
            _ => {
                tags.sort();
                TagSet::Many(tags.into())
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TagSet::Empty => 0,
            TagSet::One(_) => 1,
            TagSet::Many(tags) => tags.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TagSet::Empty)
    }

    pub fn iter(&self) -> TagSetIter<'_> {
        match self {
            TagSet::Empty => TagSetIter::Empty,
            TagSet::One(tag) => TagSetIter::One(Some(tag)),
            TagSet::Many(tags) => TagSetIter::Many(tags.iter()),
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.iter().any(|t| t == tag)
    }
}

pub enum TagSetIter<'a> {
    Empty,
    One(Option<&'a Arc<str>>),
    Many(std::slice::Iter<'a, Arc<str>>),
}

impl<'a> Iterator for TagSetIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            TagSetIter::Empty => None,
            TagSetIter::One(slot) => slot.take().map(|t| t.as_ref()),
            TagSetIter::Many(iter) => iter.next().map(|t| t.as_ref()),
        }
    }
}

/// Validates a tag attached to an entry. The wildcard is only accepted by
/// `remove_by_tag`, never on an entry.
pub fn validate_entry_tag(tag: &str) -> CacheResult<()> {
    if tag.is_empty() {
        return Err(CacheError::invalid_tag("tag is empty"));
    }
    if tag == WILDCARD_TAG {
        return Err(CacheError::invalid_tag(
            "the wildcard tag is reserved and may not be attached to an entry",
        ));
    }
    if tag.chars().any(|c| c.is_control()) {
        return Err(CacheError::invalid_tag("tag contains control characters"));
    }
    Ok(())
}

/// Validates a tag passed to `remove_by_tag`; the wildcard is allowed here.
pub fn validate_invalidation_tag(tag: &str) -> CacheResult<()> {
    if tag == WILDCARD_TAG {
        return Ok(());
    }
    validate_entry_tag(tag)
}
