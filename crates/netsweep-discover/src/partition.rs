//! Address space partitioning.
//!
//! Splits one or more base ranges into fixed-size [`ScanUnit`]s, enumerated
//! lazily in ascending numeric order. The iterator is index based, so it can
//! seek straight to a resume point without walking the units before it.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use netsweep_core::error::{CoreError, Result};
use netsweep_core::ScanUnit;

/// A fixed partition of one or more base ranges into equal-size units.
#[derive(Debug, Clone)]
pub struct Partitioner {
    ranges: Vec<Ipv4Net>,
    target_prefix: u8,
    skip_edges: bool,
}

impl Partitioner {
    pub fn new(base: Ipv4Net, target_prefix: u8) -> Result<Self> {
        Self::with_ranges([base], target_prefix)
    }

    /// Build a partition over several base ranges.
    ///
    /// Ranges are canonicalised and overlapping or adjacent ranges merged, so
    /// traversal stays strictly ascending and no address is visited twice.
    pub fn with_ranges(
        ranges: impl IntoIterator<Item = Ipv4Net>,
        target_prefix: u8,
    ) -> Result<Self> {
        if target_prefix > 32 {
            return Err(CoreError::PrefixOutOfRange {
                prefix: target_prefix,
                min: 0,
            });
        }

        let canonical: Vec<Ipv4Net> = ranges.into_iter().map(|r| r.trunc()).collect();
        let mut merged = Ipv4Net::aggregate(&canonical);
        for range in &canonical {
            if range.prefix_len() > target_prefix {
                return Err(CoreError::PrefixOutOfRange {
                    prefix: target_prefix,
                    min: range.prefix_len(),
                });
            }
        }
        merged.sort();

        Ok(Self {
            ranges: merged,
            target_prefix,
            skip_edges: false,
        })
    }

    /// Single-host units over the usable addresses of each range.
    ///
    /// The network and broadcast addresses of every (merged) range wider
    /// than `/31` are left out.
    pub fn usable_hosts(ranges: impl IntoIterator<Item = Ipv4Net>) -> Result<Self> {
        let mut part = Self::with_ranges(ranges, 32)?;
        part.skip_edges = true;
        Ok(part)
    }

    pub fn ranges(&self) -> &[Ipv4Net] {
        &self.ranges
    }

    pub fn target_prefix(&self) -> u8 {
        self.target_prefix
    }

    /// Total number of units across every range.
    pub fn len(&self) -> u64 {
        self.ranges
            .iter()
            .map(|r| {
                let (start, end) = span(r, self.target_prefix, self.skip_edges);
                end - start
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The greatest unit of the partition.
    pub fn last(&self) -> Option<ScanUnit> {
        self.ranges.iter().rev().find_map(|r| {
            let (start, end) = span(r, self.target_prefix, self.skip_edges);
            (end > start)
                .then(|| unit_at(r, self.target_prefix, end - 1))
                .flatten()
        })
    }

    /// Every unit, from the start.
    pub fn units(&self) -> Units {
        Units {
            ranges: self.ranges.clone(),
            target_prefix: self.target_prefix,
            skip_edges: self.skip_edges,
            range_idx: 0,
            offset: 0,
        }
    }

    /// Every unit that does not sort before `start`.
    ///
    /// A unit equal to `start` is included, so a resumed sweep re-scans the
    /// checkpointed unit rather than skipping it.
    pub fn units_from(&self, start: &ScanUnit) -> Units {
        let mut units = Units {
            range_idx: self.ranges.len(),
            ..self.units()
        };

        let start_base = u32::from(start.base());
        for (idx, range) in self.ranges.iter().enumerate() {
            let first = u32::from(range.network());
            let last = u32::from(range.broadcast());
            if start_base < first {
                units.range_idx = idx;
                return units;
            }
            if start_base > last {
                continue;
            }

            let shift = 32 - u32::from(self.target_prefix);
            let mut offset = u64::from(start_base - first) >> shift;
            if unit_at(range, self.target_prefix, offset).is_some_and(|u| u < *start) {
                offset += 1;
            }
            let (_, end) = span(range, self.target_prefix, self.skip_edges);
            if offset < end {
                units.range_idx = idx;
                units.offset = offset;
            } else {
                units.range_idx = idx + 1;
            }
            return units;
        }

        units
    }

    /// Enumerate through an intermediate prefix first (e.g. /8 → /16 → /24).
    ///
    /// Yields exactly the same sequence as [`Partitioner::units`]; the
    /// intermediate level only changes how the address space is walked.
    pub fn units_via(&self, intermediate: u8) -> Result<impl Iterator<Item = ScanUnit> + '_> {
        for range in &self.ranges {
            if intermediate < range.prefix_len() || intermediate > self.target_prefix {
                return Err(CoreError::PrefixOutOfRange {
                    prefix: intermediate,
                    min: range.prefix_len(),
                });
            }
        }

        let target = self.target_prefix;
        Ok(self
            .ranges
            .iter()
            .flat_map(move |range| {
                let (start, end) = span(range, target, self.skip_edges);
                range
                    .subnets(intermediate)
                    .into_iter()
                    .flatten()
                    .flat_map(move |mid| mid.subnets(target).into_iter().flatten())
                    .map(ScanUnit::from_net)
                    .enumerate()
                    .filter(move |(i, _)| (start..end).contains(&(*i as u64)))
                    .map(|(_, u)| u)
            }))
    }
}

/// An ascending source of units that can resume at a checkpoint.
pub trait UnitSource {
    type Iter: Iterator<Item = ScanUnit> + Send + 'static;

    /// Units in ascending order, skipping every unit that sorts before `marker`.
    fn resume_from(&self, marker: Option<&ScanUnit>) -> Self::Iter;

    /// The final unit, or `None` for an empty source.
    fn last(&self) -> Option<ScanUnit>;
}

impl UnitSource for Partitioner {
    type Iter = Units;

    fn resume_from(&self, marker: Option<&ScanUnit>) -> Units {
        match marker {
            Some(m) => self.units_from(m),
            None => self.units(),
        }
    }

    fn last(&self) -> Option<ScanUnit> {
        Partitioner::last(self)
    }
}

/// Lazy, restartable iterator over a partition's units.
#[derive(Debug, Clone)]
pub struct Units {
    ranges: Vec<Ipv4Net>,
    target_prefix: u8,
    skip_edges: bool,
    range_idx: usize,
    offset: u64,
}

impl Iterator for Units {
    type Item = ScanUnit;

    fn next(&mut self) -> Option<ScanUnit> {
        loop {
            let range = self.ranges.get(self.range_idx)?;
            let (start, end) = span(range, self.target_prefix, self.skip_edges);
            self.offset = self.offset.max(start);
            if self.offset < end {
                let unit = unit_at(range, self.target_prefix, self.offset)?;
                self.offset += 1;
                return Some(unit);
            }
            self.range_idx += 1;
            self.offset = 0;
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining: u64 = self
            .ranges
            .iter()
            .enumerate()
            .skip(self.range_idx)
            .map(|(idx, r)| {
                let (start, end) = span(r, self.target_prefix, self.skip_edges);
                let from = if idx == self.range_idx {
                    self.offset.max(start)
                } else {
                    start
                };
                end.saturating_sub(from)
            })
            .sum();
        match usize::try_from(remaining) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

fn units_in(range: &Ipv4Net, target_prefix: u8) -> u64 {
    1u64 << (target_prefix - range.prefix_len())
}

/// Half-open offset range of the units enumerated in `range`.
fn span(range: &Ipv4Net, target_prefix: u8, skip_edges: bool) -> (u64, u64) {
    let count = units_in(range, target_prefix);
    if skip_edges && target_prefix == 32 && range.prefix_len() <= 30 {
        (1, count - 1)
    } else {
        (0, count)
    }
}

fn unit_at(range: &Ipv4Net, target_prefix: u8, offset: u64) -> Option<ScanUnit> {
    if offset >= units_in(range, target_prefix) {
        return None;
    }
    let shift = 32 - u32::from(target_prefix);
    let base = u64::from(u32::from(range.network())) + (offset << shift);
    let addr = Ipv4Addr::from(u32::try_from(base).ok()?);
    Ipv4Net::new(addr, target_prefix).ok().map(ScanUnit::from_net)
}
