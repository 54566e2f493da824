//! Free-list allocator over a window of whole zones. The list is an
//! ordered run of extents spanning the window with no gaps; adjacent free
//! extents are always merged. A cursor ("seeker") gives allocation
//! locality: allocations scan forward from the cursor first, then
//! backward.

use serde::{Deserialize, Serialize};

use crate::core::{Result, ZnsError};

/// One run of zones, either free or claimed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub begin_zone: u64,
    pub zone_count: u64,
    pub used: bool,
}

#[derive(Debug, Clone)]
pub struct FreeList {
    extents: Vec<Extent>,
    seeker: usize,
    zones_left: u64,
    min_zone: u64,
    max_zone: u64,
}

/// Two lists are equal when they describe the same ordered ranges; the
/// cursor position is not part of the identity.
impl PartialEq for FreeList {
    fn eq(&self, other: &Self) -> bool {
        self.extents == other.extents && self.zones_left == other.zones_left
    }
}
impl Eq for FreeList {}

impl FreeList {
    pub fn new(min_zone: u64, max_zone: u64) -> Self {
        assert!(min_zone < max_zone);
        FreeList {
            extents: vec![Extent {
                begin_zone: min_zone,
                zone_count: max_zone - min_zone,
                used: false,
            }],
            seeker: 0,
            zones_left: max_zone - min_zone,
            min_zone,
            max_zone,
        }
    }

    pub fn zones_left(&self) -> u64 {
        self.zones_left
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Claim `zones` zones from the free extent at `idx`. Splits the
    /// extent when the claim is partial; an exact fit flips the extent in
    /// place, no placeholder is left behind.
    fn alloc_from(&mut self, idx: usize, zones: u64) {
        let extent = &mut self.extents[idx];
        debug_assert!(!extent.used && extent.zone_count >= zones);
        if extent.zone_count > zones {
            let rest = Extent {
                begin_zone: extent.begin_zone + zones,
                zone_count: extent.zone_count - zones,
                used: false,
            };
            extent.zone_count = zones;
            extent.used = true;
            self.extents.insert(idx + 1, rest);
        } else {
            extent.used = true;
        }
        self.zones_left -= zones;
    }

    /// Claim `requested` zones, greedily taking whole or partial free
    /// extents forward from the cursor and then backward. Returns the
    /// claimed `(begin_zone, zone_count)` regions in claim order. When the
    /// window does not hold `requested` free zones in total, fails without
    /// touching the list.
    pub fn alloc_zones(&mut self, requested: u64) -> Result<Vec<(u64, u64)>> {
        if requested > self.zones_left {
            return Err(ZnsError::invalid(
                "not enough free zones in the window",
            ));
        }
        let mut regions = Vec::new();
        let mut needed = requested;
        let start = self.seeker.min(self.extents.len() - 1);

        // forward
        let mut idx = start;
        while needed > 0 && idx < self.extents.len() {
            if !self.extents[idx].used {
                let take = self.extents[idx].zone_count.min(needed);
                self.alloc_from(idx, take);
                regions.push((self.extents[idx].begin_zone, take));
                needed -= take;
            }
            idx += 1;
        }
        // backward
        let mut idx = start;
        while needed > 0 {
            if !self.extents[idx].used {
                let take = self.extents[idx].zone_count.min(needed);
                self.alloc_from(idx, take);
                regions.push((self.extents[idx].begin_zone, take));
                needed -= take;
            }
            if idx == 0 {
                break;
            }
            idx -= 1;
        }
        debug_assert_eq!(needed, 0);
        if let Some(&(begin, _)) = regions.last() {
            // leave the cursor on the most recently claimed extent
            self.seeker = self.index_of(begin).unwrap_or(0);
        }
        Ok(regions)
    }

    fn index_of(&self, zone: u64) -> Option<usize> {
        self.extents.iter().position(|e| {
            e.begin_zone <= zone && zone < e.begin_zone + e.zone_count
        })
    }

    /// Index of the extent containing `zone`.
    pub fn find_region(&self, zone: u64) -> Result<usize> {
        self.index_of(zone)
            .ok_or_else(|| ZnsError::invalid("zone outside the window"))
    }

    /// Release the extent at `idx`, merging with the left neighbour first
    /// and then the right one so adjacent free extents never persist.
    pub fn free_zones(&mut self, idx: usize) -> Result<()> {
        if idx >= self.extents.len() || !self.extents[idx].used {
            return Err(ZnsError::invalid("extent is not allocated"));
        }
        self.extents[idx].used = false;
        self.zones_left += self.extents[idx].zone_count;
        let mut idx = idx;
        if idx > 0 && !self.extents[idx - 1].used {
            self.extents[idx - 1].zone_count += self.extents[idx].zone_count;
            self.extents.remove(idx);
            idx -= 1;
        }
        if idx + 1 < self.extents.len() && !self.extents[idx + 1].used {
            self.extents[idx].zone_count += self.extents[idx + 1].zone_count;
            self.extents.remove(idx + 1);
        }
        self.seeker = idx;
        Ok(())
    }

    /// Serialize the list to a byte sequence the caller can persist.
    pub fn encode(&self) -> Vec<u8> {
        // lists always hold at least one extent, this cannot fail
        bincode::serialize(&self.extents).unwrap_or_default()
    }

    /// Reconstruct a list from [`FreeList::encode`] output. The ranges and
    /// the free-zone count are recovered exactly.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let extents: Vec<Extent> = bincode::deserialize(data)
            .map_err(|e| ZnsError::invalid(format!("bad encoding: {e}")))?;
        if extents.is_empty() {
            return Err(ZnsError::invalid("empty free list encoding"));
        }
        let mut expected = extents[0].begin_zone;
        let mut zones_left = 0;
        for extent in &extents {
            if extent.begin_zone != expected || extent.zone_count == 0 {
                return Err(ZnsError::invalid("free list ranges have gaps"));
            }
            expected += extent.zone_count;
            if !extent.used {
                zones_left += extent.zone_count;
            }
        }
        Ok(FreeList {
            min_zone: extents[0].begin_zone,
            max_zone: expected,
            extents,
            seeker: 0,
            zones_left,
        })
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let mut expected = self.min_zone;
        let mut free = 0;
        let mut prev_free = false;
        for extent in &self.extents {
            assert_eq!(extent.begin_zone, expected);
            assert!(extent.zone_count > 0);
            assert!(!(prev_free && !extent.used), "unmerged free extents");
            expected += extent.zone_count;
            if !extent.used {
                free += extent.zone_count;
            }
            prev_free = !extent.used;
        }
        assert_eq!(expected, self.max_zone);
        assert_eq!(free, self.zones_left);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_restore_the_list() {
        let mut list = FreeList::new(10, 18);
        let before = list.clone();
        let regions = list.alloc_zones(3).unwrap();
        assert_eq!(regions, vec![(10, 3)]);
        list.check_invariants();
        for (begin, _) in regions {
            let idx = list.find_region(begin).unwrap();
            list.free_zones(idx).unwrap();
        }
        list.check_invariants();
        assert_eq!(list, before);
    }

    #[test]
    fn exact_fit_leaves_no_placeholder() {
        let mut list = FreeList::new(0, 4);
        list.alloc_zones(4).unwrap();
        assert_eq!(list.extents().len(), 1);
        assert!(list.extents()[0].used);
        assert_eq!(list.zones_left(), 0);
        list.check_invariants();
    }

    #[test]
    fn insufficient_space_commits_nothing() {
        let mut list = FreeList::new(0, 8);
        list.alloc_zones(6).unwrap();
        let snapshot = list.clone();
        assert!(list.alloc_zones(3).is_err());
        assert_eq!(list, snapshot);
        list.check_invariants();
    }

    #[test]
    fn hole_reuse_is_first_fit_from_the_cursor() {
        let mut list = FreeList::new(0, 8);
        let a = list.alloc_zones(3).unwrap();
        let b = list.alloc_zones(2).unwrap();
        let c = list.alloc_zones(3).unwrap();
        assert_eq!((a[0], b[0], c[0]), ((0, 3), (3, 2), (5, 3)));
        assert_eq!(list.zones_left(), 0);
        // free the middle region; the cursor parks on the hole
        let idx = list.find_region(3).unwrap();
        list.free_zones(idx).unwrap();
        list.check_invariants();
        let reuse = list.alloc_zones(2).unwrap();
        assert_eq!(reuse, vec![(3, 2)]);
        assert!(list.alloc_zones(3).is_err());
    }

    #[test]
    fn fragmented_allocation_spans_regions() {
        let mut list = FreeList::new(0, 10);
        let a = list.alloc_zones(2).unwrap();
        let b = list.alloc_zones(2).unwrap();
        let _c = list.alloc_zones(6).unwrap();
        list.free_zones(list.find_region(a[0].0).unwrap()).unwrap();
        list.free_zones(list.find_region(b[0].0).unwrap()).unwrap();
        list.check_invariants();
        // 4 free zones in one merged hole at the front
        assert_eq!(list.zones_left(), 4);
        let spanning = list.alloc_zones(4).unwrap();
        assert_eq!(spanning.iter().map(|r| r.1).sum::<u64>(), 4);
        list.check_invariants();
    }

    #[test]
    fn merge_runs_both_ways() {
        let mut list = FreeList::new(0, 9);
        let a = list.alloc_zones(3).unwrap();
        let b = list.alloc_zones(3).unwrap();
        let c = list.alloc_zones(3).unwrap();
        list.free_zones(list.find_region(a[0].0).unwrap()).unwrap();
        list.free_zones(list.find_region(c[0].0).unwrap()).unwrap();
        // freeing the middle extent collapses the whole window
        list.free_zones(list.find_region(b[0].0).unwrap()).unwrap();
        assert_eq!(list.extents().len(), 1);
        assert_eq!(list.zones_left(), 9);
        list.check_invariants();
    }

    #[test]
    fn encoding_round_trips() {
        let mut list = FreeList::new(4, 20);
        list.alloc_zones(5).unwrap();
        list.alloc_zones(2).unwrap();
        let idx = list.find_region(4).unwrap();
        list.free_zones(idx).unwrap();
        let decoded = FreeList::decode(&list.encode()).unwrap();
        assert_eq!(decoded, list);
        assert_eq!(decoded.zones_left(), list.zones_left());
        decoded.check_invariants();
    }

    #[test]
    fn decode_rejects_gaps() {
        let broken = bincode::serialize(&vec![
            Extent {
                begin_zone: 0,
                zone_count: 2,
                used: false,
            },
            Extent {
                begin_zone: 5,
                zone_count: 2,
                used: true,
            },
        ])
        .unwrap();
        assert!(FreeList::decode(&broken).is_err());
    }
}
