//! Window geometry and rectangles

/// Window geometry as reported by the server.
///
/// `x`/`y` locate the outer (border) corner relative to the root, `width`
/// and `height` exclude the border.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub border_width: u32,
}

impl Geometry {
    pub fn new(x: i32, y: i32, width: u32, height: u32, border_width: u32) -> Self {
        Self { x, y, width, height, border_width }
    }

    /// Full width including both borders
    pub fn outer_width(&self) -> u32 {
        self.width + self.border_width * 2
    }

    /// Full height including both borders
    pub fn outer_height(&self) -> u32 {
        self.height + self.border_width * 2
    }

    /// Bounding box including the border
    pub fn outer_rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.outer_width(), self.outer_height())
    }

    /// Whether the outer size differs from `other`'s
    pub fn size_differs(&self, other: &Geometry) -> bool {
        self.outer_width() != other.outer_width() || self.outer_height() != other.outer_height()
    }
}

/// An axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Translate by (dx, dy)
    pub fn offset(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Overlap of two rectangles, `None` when they do not intersect
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let left = (self.x as i64).max(other.x as i64);
        let top = (self.y as i64).max(other.y as i64);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return None;
        }
        Some(Rect::new(left as i32, top as i32, (right - left) as u32, (bottom - top) as u32))
    }

    /// Convert to clip-space corners `(left, top, right, bottom)` for a
    /// screen of `screen_width` x `screen_height`.
    ///
    /// `x_clip = 2x/W - 1`, `y_clip = 1 - 2y/H`.
    pub fn to_clip_space(&self, screen_width: u32, screen_height: u32) -> [f32; 4] {
        let w = screen_width.max(1) as f32;
        let h = screen_height.max(1) as f32;
        let left = 2.0 * self.x as f32 / w - 1.0;
        let right = 2.0 * self.right() as f32 / w - 1.0;
        let top = 1.0 - 2.0 * self.y as f32 / h;
        let bottom = 1.0 - 2.0 * self.bottom() as f32 / h;
        [left, top, right, bottom]
    }
}
