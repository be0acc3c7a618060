//! Three-component tensor extents.
//!
//! Every tensor in the graph is laid out as `d` slices of `h` rows of `w`
//! contiguous floats. The depth axis doubles as the batch axis, so a batch of
//! 8 feature maps with 3 channels each is simply `d = 24`.

use core::fmt;

/// Width, height and depth of a tensor, row-major with `w` fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    /// Elements per row.
    pub w: usize,
    /// Rows per depth slice.
    pub h: usize,
    /// Depth slices (channels and batch).
    pub d: usize,
}

impl Shape {
    /// Creates a shape from its three extents.
    pub const fn new(w: usize, h: usize, d: usize) -> Self {
        Self { w, h, d }
    }

    /// A single row of `w` elements.
    pub const fn vector(w: usize) -> Self {
        Self::new(w, 1, 1)
    }

    /// A single `w × h` slice.
    pub const fn matrix(w: usize, h: usize) -> Self {
        Self::new(w, h, 1)
    }

    /// The `1×1×1` shape used by reductions.
    pub const fn scalar() -> Self {
        Self::new(1, 1, 1)
    }

    /// Total number of elements.
    pub const fn len(&self) -> usize {
        self.w * self.h * self.d
    }

    /// Returns `true` if any extent is zero.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements in one depth slice.
    pub const fn slice_len(&self) -> usize {
        self.w * self.h
    }

    /// Total number of `w`-wide rows across all slices.
    pub const fn rows(&self) -> usize {
        self.h * self.d
    }

    /// Returns `true` for `(w, 1, 1)` shapes, the right operand of a row broadcast.
    pub const fn is_row_vector(&self) -> bool {
        self.h == 1 && self.d == 1
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.w, self.h, self.d)
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((w, h, d): (usize, usize, usize)) -> Self {
        Self::new(w, h, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths() {
        let s = Shape::new(3, 2, 4);
        assert_eq!(s.len(), 24);
        assert_eq!(s.slice_len(), 6);
        assert_eq!(s.rows(), 8);
        assert!(!s.is_row_vector());
        assert!(Shape::vector(5).is_row_vector());
        assert!(Shape::new(0, 3, 3).is_empty());
    }

    #[test]
    fn display() {
        assert_eq!(Shape::matrix(4, 2).to_string(), "4x2x1");
        assert_eq!(Shape::from((1, 2, 3)), Shape::new(1, 2, 3));
    }
}
