//! Sparse firmware image, held as an ordered set of disjoint byte ranges.
use anyhow::Result;

/// A contiguous run of firmware bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub base: u32,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn new(base: u32, data: Vec<u8>) -> Self {
        debug_assert!(
            u64::from(base) + data.len() as u64 <= 1 << 32,
            "segment exceeds the 32-bit address space"
        );
        Segment { base, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + self.data.len() as u64
    }

    pub fn is_contiguous_with(&self, other: &Segment) -> bool {
        self.end() == u64::from(other.base)
    }

    /// Cut `[start, end)` out of this segment, returning what is left of it.
    ///
    /// Yields no segment when the range covers it completely, one when the range covers its
    /// head or its tail, and two when the range lies strictly inside it.
    fn trim(self, start: u64, end: u64) -> Vec<Segment> {
        let base = u64::from(self.base);
        let mut remainders = Vec::with_capacity(2);
        if start > base {
            let head = (start - base) as usize;
            remainders.push(Segment::new(self.base, self.data[..head].to_vec()));
        }
        if end < self.end() {
            let tail = (end - base) as usize;
            remainders.push(Segment::new(end as u32, self.data[tail..].to_vec()));
        }
        remainders
    }
}

/// Segment store.
///
/// After every mutation the segments are sorted by base address, pairwise disjoint and
/// never adjacent to one another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareData {
    segments: Vec<Segment>,
}

impl FirmwareData {
    pub fn new() -> Self {
        FirmwareData::default()
    }

    /// Store `data` at `address`, replacing whatever was stored in that range before.
    pub fn add_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        anyhow::ensure!(!data.is_empty(), "cannot add empty data at {:#010x}", address);
        anyhow::ensure!(
            u64::from(address) + data.len() as u64 <= 1 << 32,
            "data at {:#010x} with {} bytes exceeds the address space",
            address,
            data.len()
        );
        self.remove_data(address, data.len() as u32);
        self.segments.push(Segment::new(address, data.to_vec()));
        self.merge_segments();
        Ok(())
    }

    /// Remove every stored byte in `[address, address + len)`.
    pub fn remove_data(&mut self, address: u32, len: u32) {
        let start = u64::from(address);
        let end = start + u64::from(len);
        let (Some(min), Some(max)) = (self.min_address(), self.max_address()) else {
            return;
        };
        if len == 0 || end <= u64::from(min) || start >= max {
            return;
        }

        // First segment whose tail enters the range, last one whose head does.
        let Some(first) = self.segments.iter().position(|s| s.end() > start) else {
            return;
        };
        let Some(last) = self
            .segments
            .iter()
            .rposition(|s| u64::from(s.base) < end)
        else {
            return;
        };
        if first > last {
            // The range falls into a gap.
            return;
        }

        let removed: Vec<Segment> = self.segments.drain(first..=last).collect();
        let count = removed.len();
        for (i, segment) in removed.into_iter().enumerate() {
            // Everything strictly between the first and the last one is covered.
            if i == 0 || i == count - 1 {
                self.segments.extend(segment.trim(start, end));
            }
        }
        self.merge_segments();
    }

    /// Sort the segments and join every pair that touches.
    pub fn merge_segments(&mut self) {
        self.segments.sort_by_key(|s| s.base);

        let mut i = 0;
        while i + 1 < self.segments.len() {
            if self.segments[i].is_contiguous_with(&self.segments[i + 1]) {
                let next = self.segments.remove(i + 1);
                self.segments[i].data.extend(next.data);
                // The grown segment may now touch the one after it.
                continue;
            }
            i += 1;
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Panics if `index` is out of range.
    pub fn segment(&self, index: usize) -> &Segment {
        assert!(
            index < self.segments.len(),
            "segment index {} out of range ({} segments)",
            index,
            self.segments.len()
        );
        &self.segments[index]
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn min_address(&self) -> Option<u32> {
        self.segments.first().map(|s| s.base)
    }

    /// Exclusive end of the highest segment.
    pub fn max_address(&self) -> Option<u64> {
        self.segments.last().map(Segment::end)
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }
}
