//! Texture partitioning
//!
//! Pixmaps larger than the device's maximum texture size are split into
//! tiles. Each tile remembers which edges of the whole it touches.

use bitflags::bitflags;

use crate::shared::Rect;

bitflags! {
    /// Edges of the partitioned pixmap a tile lies on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BorderFlags: u8 {
        const NORTH = 0b0001;
        const EAST = 0b0010;
        const SOUTH = 0b0100;
        const WEST = 0b1000;
    }
}

/// One tile, positioned relative to the pixmap's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub rect: Rect,
    pub borders: BorderFlags,
}

/// Split `width` x `height` into `ceil(W/L) x ceil(H/L)` tiles, row-major
/// from the top-left. Rightmost and bottommost tiles carry the remainder.
pub fn partition(width: u32, height: u32, limit: u32) -> Vec<Partition> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let limit = limit.max(1);
    let columns = width.div_ceil(limit);
    let rows = height.div_ceil(limit);

    let mut tiles = Vec::with_capacity((columns * rows) as usize);
    for row in 0..rows {
        for column in 0..columns {
            let x = column * limit;
            let y = row * limit;
            let mut borders = BorderFlags::empty();
            if row == 0 {
                borders |= BorderFlags::NORTH;
            }
            if row == rows - 1 {
                borders |= BorderFlags::SOUTH;
            }
            if column == 0 {
                borders |= BorderFlags::WEST;
            }
            if column == columns - 1 {
                borders |= BorderFlags::EAST;
            }
            tiles.push(Partition {
                rect: Rect::new(x as i32, y as i32, limit.min(width - x), limit.min(height - y)),
                borders,
            });
        }
    }
    tiles
}
