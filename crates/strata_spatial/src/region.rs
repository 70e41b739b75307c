//! # Regions
//!
//! Elementary units are grouped into square regions of `size × size` units.
//! A region is the unit of scheduling and of batch submission.
//!
//! ```text
//!   size = 5
//!
//!   unit x:  -10 .. -6 | -5 .. -1 | 0 .. 4 | 5 .. 9
//!   region:      -2    |    -1    |   0    |   1      (floor division)
//! ```

/// An elementary spatial work unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitPos {
    /// X coordinate, in units.
    pub x: i32,
    /// Z coordinate, in units.
    pub z: i32,
}

impl UnitPos {
    /// Creates a unit position.
    #[inline]
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// Identity of a work region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    /// Namespace (dimension) the region lives in.
    pub namespace: u32,
    /// X coordinate, in regions.
    pub x: i32,
    /// Z coordinate, in regions.
    pub z: i32,
}

impl RegionKey {
    /// Creates a region key.
    #[inline]
    #[must_use]
    pub const fn new(namespace: u32, x: i32, z: i32) -> Self {
        Self { namespace, x, z }
    }

    /// The region owning `unit`.
    #[inline]
    #[must_use]
    pub fn containing(namespace: u32, unit: UnitPos, size: u32) -> Self {
        let size = region_span(size);
        Self {
            namespace,
            x: unit.x.div_euclid(size),
            z: unit.z.div_euclid(size),
        }
    }

    /// Unit at the region's minimum corner.
    #[must_use]
    pub fn origin(self, size: u32) -> UnitPos {
        let size = region_span(size);
        UnitPos::new(self.x.saturating_mul(size), self.z.saturating_mul(size))
    }

    /// Every unit in the region, row by row.
    pub fn units(self, size: u32) -> impl Iterator<Item = UnitPos> {
        let span = region_span(size);
        let origin = self.origin(size);
        (0..span).flat_map(move |dz| {
            (0..span).map(move |dx| UnitPos::new(origin.x + dx, origin.z + dz))
        })
    }

    /// Manhattan distance in regions. Different namespaces are infinitely far.
    #[must_use]
    pub fn manhattan(self, other: Self) -> u32 {
        if self.namespace != other.namespace {
            return u32::MAX;
        }
        self.x.abs_diff(other.x).saturating_add(self.z.abs_diff(other.z))
    }

    /// The eight surrounding regions.
    #[must_use]
    pub fn neighbours(self) -> [Self; 8] {
        const OFFSETS: [(i32, i32); 8] = [
            (-1, -1),
            (0, -1),
            (1, -1),
            (-1, 0),
            (1, 0),
            (-1, 1),
            (0, 1),
            (1, 1),
        ];
        OFFSETS.map(|(dx, dz)| {
            Self::new(
                self.namespace,
                self.x.saturating_add(dx),
                self.z.saturating_add(dz),
            )
        })
    }
}

impl std::fmt::Display for RegionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{},{}", self.namespace, self.x, self.z)
    }
}

fn region_span(size: u32) -> i32 {
    i32::try_from(size.max(1)).unwrap_or(i32::MAX)
}
