use crate::SegmentError;
use cuckoofilter::{CuckooFilter, ExportedCuckooFilter};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;

/// Membership filter over the keys of a segment. May return false positives, never false
/// negatives, so a hit must be followed by data verification on retrieval.
pub trait InclusionFilter {
    /// Add element to the inclusion list.
    fn add(&mut self, element: &[u8]) -> Result<(), SegmentError>;

    /// Checks if the element belongs to the inclusion list. **There might be false positives.**
    fn contains(&self, element: &[u8]) -> Result<bool, SegmentError>;

    fn size(&self) -> usize;
}

/// Enum with different [`InclusionFilter`] types.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum InclusionFilters {
    Cuckoo(Cuckoo),
}

impl InclusionFilter for InclusionFilters {
    fn add(&mut self, element: &[u8]) -> Result<(), SegmentError> {
        match self {
            Self::Cuckoo(c) => c.add(element),
        }
    }

    fn contains(&self, element: &[u8]) -> Result<bool, SegmentError> {
        match self {
            Self::Cuckoo(c) => c.contains(element),
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Cuckoo(c) => c.size(),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct Cuckoo {
    exported: Option<ExportedCuckooFilter>,
    remaining: usize,
    #[serde(skip)]
    filter: Option<CuckooFilter<DefaultHasher>>,
}

impl Cuckoo {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            exported: None,
            remaining: max_capacity,
            filter: Some(CuckooFilter::with_capacity(max_capacity)),
        }
    }

    /// Restores the queryable filter from its exported form after deserialization.
    pub fn was_loaded(&mut self) {
        self.filter = self.exported.take().map(Into::into);
    }

    /// Moves the filter into its exported, serializable form.
    pub fn freeze(&mut self) {
        if let Some(filter) = self.filter.take() {
            self.exported = Some(filter.export());
        }
    }
}

impl InclusionFilter for Cuckoo {
    fn add(&mut self, element: &[u8]) -> Result<(), SegmentError> {
        if self.remaining == 0 {
            return Err(SegmentError::FilterMaxCapacity)
        }
        let filter = self.filter.as_mut().ok_or(SegmentError::FilterCuckooNotLoaded)?;

        self.remaining -= 1;

        filter.add(element).map_err(|err| SegmentError::Custom(err.to_string()))
    }

    fn contains(&self, element: &[u8]) -> Result<bool, SegmentError> {
        Ok(self.filter.as_ref().ok_or(SegmentError::FilterCuckooNotLoaded)?.contains(element))
    }

    fn size(&self) -> usize {
        self.filter.as_ref().map(|f| f.memory_usage()).unwrap_or_default()
    }
}

impl std::fmt::Debug for Cuckoo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cuckoo")
            .field("remaining", &self.remaining)
            .field("filter.is_some()", &self.filter.is_some())
            .field("exported.is_some()", &self.exported.is_some())
            .finish()
    }
}

impl PartialEq for Cuckoo {
    fn eq(&self, other: &Self) -> bool {
        self.remaining == other.remaining && self.filter.is_some() == other.filter.is_some()
    }
}
