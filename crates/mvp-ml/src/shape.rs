//! NHWC tensor shapes.

/// Tensor shape in NHWC order.
///
/// Filters use the same layout with `batches` holding the output channel
/// count (OHWI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    /// Batch count (N), or output channels for a filter.
    pub batches: usize,
    /// Height (H).
    pub height: usize,
    /// Width (W).
    pub width: usize,
    /// Channels (C).
    pub channels: usize,
}

impl Shape {
    /// Shape from `[n, h, w, c]`.
    pub const fn new(batches: usize, height: usize, width: usize, channels: usize) -> Self {
        Self {
            batches,
            height,
            width,
            channels,
        }
    }

    /// Total number of elements.
    #[must_use]
    pub const fn element_count(&self) -> usize {
        self.batches * self.height * self.width * self.channels
    }

    /// Element offset of `(n, y, x, c)`.
    #[must_use]
    pub const fn offset(&self, n: usize, y: usize, x: usize, c: usize) -> usize {
        ((n * self.height + y) * self.width + x) * self.channels + c
    }

    /// Elements per row (`W * C`).
    #[must_use]
    pub const fn row_elements(&self) -> usize {
        self.width * self.channels
    }

    /// Elements per image (`H * W * C`).
    #[must_use]
    pub const fn image_elements(&self) -> usize {
        self.height * self.width * self.channels
    }

    /// True if no dimension is zero.
    #[must_use]
    pub const fn is_populated(&self) -> bool {
        self.batches > 0 && self.height > 0 && self.width > 0 && self.channels > 0
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.batches, self.height, self.width, self.channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_is_nhwc() {
        let s = Shape::new(2, 3, 4, 5);
        assert_eq!(s.offset(0, 0, 0, 0), 0);
        assert_eq!(s.offset(0, 0, 0, 4), 4);
        assert_eq!(s.offset(0, 0, 1, 0), 5);
        assert_eq!(s.offset(0, 1, 0, 0), 20);
        assert_eq!(s.offset(1, 0, 0, 0), 60);
        assert_eq!(s.offset(1, 2, 3, 4), s.element_count() - 1);
    }

    #[test]
    fn test_shape_display() {
        assert_eq!(Shape::new(1, 28, 28, 3).to_string(), "[1, 28, 28, 3]");
    }

    #[test]
    fn test_is_populated() {
        assert!(Shape::new(1, 1, 1, 1).is_populated());
        assert!(!Shape::new(1, 0, 1, 1).is_populated());
    }
}
