//! Conversion of workload sizes into thread group counts.
//!
//! A kernel declares how many threads one group runs along each axis; a
//! dispatch names how many groups to launch. Every input is clamped to at
//! least 1 so that an empty or negative workload still launches one group and
//! a missing thread count never divides by zero.

use derive_more::{Deref, Display, From, Into};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Thread group counts along x, y and z. Every component is at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("({}, {}, {})", _0[0], _0[1], _0[2])]
pub struct DispatchDimensions([u32; 3]);

impl Default for DispatchDimensions {
    #[inline]
    fn default() -> Self {
        Self([1, 1, 1])
    }
}

impl DispatchDimensions {
    /// Manual override. Components below 1 are raised to 1.
    #[inline]
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self([clamp(x), clamp(y), clamp(z)])
    }

    #[inline]
    pub const fn x(&self) -> u32 {
        self.0[0]
    }

    #[inline]
    pub const fn y(&self) -> u32 {
        self.0[1]
    }

    #[inline]
    pub const fn z(&self) -> u32 {
        self.0[2]
    }

    /// Total number of groups launched.
    #[inline]
    pub const fn count(&self) -> u64 {
        self.0[0] as u64 * self.0[1] as u64 * self.0[2] as u64
    }
}

#[inline]
fn clamp(x: i64) -> u32 {
    x.clamp(1, u32::MAX as i64) as u32
}

#[inline]
fn threads(threads: [u32; 3]) -> [u64; 3] {
    threads.map(|x| x.max(1) as u64)
}

#[inline]
fn div_ceil(x: i64, y: u64) -> u32 {
    let x = clamp(x) as u64;
    x.div_ceil(y).min(u32::MAX as u64) as u32
}

/// Lays `len` work items out along x, one item per thread.
///
/// Returns the dimensions and the thread width `groups × tx`, which a kernel
/// needs to rebuild a flat index from a 2D or 3D thread id.
pub fn groups_1d(len: i64, thread_group: [u32; 3]) -> (DispatchDimensions, u32) {
    let [tx, ty, tz] = threads(thread_group);
    let groups = div_ceil(len, tx * ty * tz);
    let width = (groups as u64 * tx).min(u32::MAX as u64) as u32;
    (DispatchDimensions([groups, 1, 1]), width)
}

/// Covers a `width × height` grid. The z count is the kernel's own z thread count.
pub fn groups_2d(width: i64, height: i64, thread_group: [u32; 3]) -> DispatchDimensions {
    let [tx, ty, tz] = threads(thread_group);
    DispatchDimensions([div_ceil(width, tx), div_ceil(height, ty), tz as u32])
}

/// Covers a `width × height × depth` volume.
pub fn groups_3d(
    width: i64,
    height: i64,
    depth: i64,
    thread_group: [u32; 3],
) -> DispatchDimensions {
    let [tx, ty, tz] = threads(thread_group);
    DispatchDimensions([
        div_ceil(width, tx),
        div_ceil(height, ty),
        div_ceil(depth, tz),
    ])
}

#[cfg(test)]
mod tests {
    use super::{DispatchDimensions, groups_1d, groups_2d, groups_3d};

    #[test]
    fn test_groups_1d() {
        let (dims, width) = groups_1d(1000, [256, 1, 1]);
        assert_eq!(*dims, [4, 1, 1]);
        assert_eq!(width, 1024);

        let (dims, width) = groups_1d(1024, [256, 1, 1]);
        assert_eq!(*dims, [4, 1, 1]);
        assert_eq!(width, 1024);

        // threads in y and z still count towards the group size
        let (dims, width) = groups_1d(1000, [8, 8, 2]);
        assert_eq!(*dims, [8, 1, 1]);
        assert_eq!(width, 64);
    }

    #[test]
    fn test_groups_2d() {
        assert_eq!(*groups_2d(1024, 1024, [8, 8, 1]), [128, 128, 1]);
        assert_eq!(*groups_2d(1000, 10, [16, 16, 1]), [63, 1, 1]);
        assert_eq!(*groups_2d(64, 64, [8, 8, 4]), [8, 8, 4]);
    }

    #[test]
    fn test_groups_3d() {
        assert_eq!(*groups_3d(64, 64, 64, [4, 4, 4]), [16, 16, 16]);
        assert_eq!(*groups_3d(65, 1, 3, [4, 4, 4]), [17, 1, 1]);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(*groups_1d(0, [256, 1, 1]).0, [1, 1, 1]);
        assert_eq!(*groups_1d(-42, [256, 1, 1]).0, [1, 1, 1]);
        assert_eq!(*groups_1d(10, [0, 0, 0]).0, [10, 1, 1]);
        assert_eq!(*groups_2d(0, -1, [8, 8, 0]), [1, 1, 1]);
        assert_eq!(*groups_3d(-1, 0, -100, [0, 4, 4]), [1, 1, 1]);
        assert_eq!(*groups_3d(7, 0, 0, [0, 0, 0]), [7, 1, 1]);
        assert_eq!(DispatchDimensions::new(0, -3, 5), DispatchDimensions::from([1, 1, 5]));
        assert_eq!(DispatchDimensions::default().count(), 1);
    }
}
