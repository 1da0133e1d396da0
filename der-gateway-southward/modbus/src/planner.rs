use der_gateway_sdk::{DriverError, DriverResult};
use std::fmt;

/// Inclusive `[min, max]` span of register addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    min: u16,
    max: u16,
}

impl AddressRange {
    /// Build a range, failing when `min > max`.
    pub fn new(min: u16, max: u16) -> DriverResult<Self> {
        if min > max {
            return Err(DriverError::ValidationError(format!(
                "Invalid address range {min}-{max}: min exceeds max"
            )));
        }
        Ok(Self { min, max })
    }

    #[inline]
    pub fn single(address: u16) -> Self {
        Self {
            min: address,
            max: address,
        }
    }

    /// Range covering `length` addresses from `start`, clamped to the address space.
    pub fn with_length(start: u16, length: u16) -> DriverResult<Self> {
        if length == 0 {
            return Err(DriverError::ValidationError(format!(
                "Empty address range at {start}"
            )));
        }
        let max = start.checked_add(length - 1).ok_or_else(|| {
            DriverError::ValidationError(format!(
                "Range of {length} addresses at {start} exceeds address space"
            ))
        })?;
        Ok(Self { min: start, max })
    }

    #[inline]
    pub fn min(&self) -> u16 {
        self.min
    }

    #[inline]
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Number of addresses covered, `max - min + 1`.
    #[inline]
    pub fn len(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }

    #[inline]
    pub fn contains(&self, address: u16) -> bool {
        self.min <= address && address <= self.max
    }

    /// Whether the ranges overlap or touch.
    #[inline]
    fn joins(&self, other: &AddressRange) -> bool {
        u32::from(self.min) <= u32::from(other.max) + 1
            && u32::from(other.min) <= u32::from(self.max) + 1
    }

    /// Unused addresses between this range and a later one.
    #[inline]
    fn gap_to(&self, next: &AddressRange) -> u32 {
        u32::from(next.min) - u32::from(self.max) - 1
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Sorted set of disjoint, non-adjacent address ranges.
///
/// Used by drivers to turn the registers they need into as few read requests as possible.
/// The set is pure data; nothing here performs I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRangeSet {
    ranges: Vec<AddressRange>,
}

impl AddressRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[min, max]`, merging with any overlapping or adjacent ranges.
    ///
    /// Returns `true` when the set changed.
    pub fn add(&mut self, min: u16, max: u16) -> DriverResult<bool> {
        Ok(self.add_range(AddressRange::new(min, max)?))
    }

    #[inline]
    pub fn add_address(&mut self, address: u16) -> bool {
        self.add_range(AddressRange::single(address))
    }

    /// Insert a range in one linear pass over the sorted list.
    pub fn add_range(&mut self, range: AddressRange) -> bool {
        // first range that could join: its max + 1 >= range.min
        let start = self
            .ranges
            .partition_point(|r| u32::from(r.max) + 1 < u32::from(range.min));
        let mut end = start;
        let mut merged = range;
        while end < self.ranges.len() && self.ranges[end].joins(&merged) {
            merged.min = merged.min.min(self.ranges[end].min);
            merged.max = merged.max.max(self.ranges[end].max);
            end += 1;
        }
        if end == start + 1 && self.ranges[start] == merged {
            return false;
        }
        self.ranges.splice(start..end, std::iter::once(merged));
        true
    }

    /// The sorted, merged ranges.
    #[inline]
    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressRange> {
        self.ranges.iter()
    }

    /// Number of ranges.
    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of addresses covered.
    pub fn address_count(&self) -> u32 {
        self.ranges.iter().map(AddressRange::len).sum()
    }

    pub fn contains(&self, address: u16) -> bool {
        let idx = self.ranges.partition_point(|r| r.max < address);
        self.ranges.get(idx).is_some_and(|r| r.contains(address))
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Merge ranges to reduce the number of requests, never exceeding `max_range_length`.
    ///
    /// Repeatedly joins the adjacent pair with the smallest gap whose combined length fits
    /// the cap, ties going to the lower address. Returns a new set; `self` is untouched.
    pub fn combine_to_reduce_size(&self, max_range_length: u32) -> DriverResult<AddressRangeSet> {
        if max_range_length == 0 {
            return Err(DriverError::ValidationError(
                "Maximum range length must be at least 1".to_string(),
            ));
        }
        let mut ranges = self.ranges.clone();
        loop {
            let best = ranges
                .windows(2)
                .enumerate()
                .filter(|(_, w)| u32::from(w[1].max) - u32::from(w[0].min) < max_range_length)
                .min_by_key(|(i, w)| (w[0].gap_to(&w[1]), *i))
                .map(|(i, _)| i);
            let Some(i) = best else {
                break;
            };
            ranges[i].max = ranges[i + 1].max;
            ranges.remove(i + 1);
        }
        Ok(AddressRangeSet { ranges })
    }

    /// Split ranges longer than `max_length` into consecutive chunks of at most that length.
    pub fn split_to_max_length(&self, max_length: u16) -> DriverResult<Vec<AddressRange>> {
        if max_length == 0 {
            return Err(DriverError::ValidationError(
                "Maximum read length must be at least 1".to_string(),
            ));
        }
        let mut out = Vec::with_capacity(self.ranges.len());
        for r in &self.ranges {
            let mut start = u32::from(r.min);
            let end = u32::from(r.max);
            while start <= end {
                let stop = (start + u32::from(max_length) - 1).min(end);
                out.push(AddressRange {
                    min: start as u16,
                    max: stop as u16,
                });
                start = stop + 1;
            }
        }
        Ok(out)
    }
}

impl fmt::Display for AddressRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{r}")?;
        }
        f.write_str("}")
    }
}

impl FromIterator<AddressRange> for AddressRangeSet {
    fn from_iter<T: IntoIterator<Item = AddressRange>>(iter: T) -> Self {
        let mut set = AddressRangeSet::new();
        for r in iter {
            set.add_range(r);
        }
        set
    }
}

impl<'a> IntoIterator for &'a AddressRangeSet {
    type Item = &'a AddressRange;
    type IntoIter = std::slice::Iter<'a, AddressRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}
