//! Paints the dot-grid bitmap for one page.
//!
//! Every block cell is framed by a sync ring: a filled guard row and
//! column shared between neighbours, and an alternating row and column the
//! sampler can lock onto. Dot painted black = bit 1, LSB first within
//! each byte, row-major over the NDOT x NDOT matrix.

use super::{PageLayout, BLOCK_CELLS};
use crate::paperback::{block::RawBlock, NDOT};

const WHITE: u8 = 255;
const BLACK: u8 = 0;

pub struct PageRaster {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl PageRaster {
    pub fn new(layout: &PageLayout) -> PageRaster {
        PageRaster {
            width: layout.width,
            height: layout.height,
            pixels: vec![WHITE; layout.width * layout.height],
        }
    }

    /// Paints one dot mark whose cell origin is at (x, y), centered.
    fn dot(&mut self, layout: &PageLayout, x: usize, y: usize) {
        let off = (layout.cellpx - layout.dotsize) / 2;
        let x = x + off;
        let y = y + off;
        for dy in 0..layout.dotsize {
            let row = (y + dy) * self.width;
            for dx in 0..layout.dotsize {
                if x + dx < self.width && y + dy < self.height {
                    self.pixels[row + x + dx] = BLACK;
                }
            }
        }
    }

    fn cell_dot(&mut self, layout: &PageLayout, bx: usize, by: usize, col: usize, row: usize) {
        let x = layout.border + bx * layout.block_side + col * layout.cellpx;
        let y = layout.border + by * layout.block_side + row * layout.cellpx;
        self.dot(layout, x, y);
    }

    /// Paints the 128-byte frame into block cell (bx, by).
    pub fn draw_block(&mut self, layout: &PageLayout, bx: usize, by: usize, frame: &RawBlock) {
        // Guard row and column, filled across the whole block pitch so
        // neighbouring blocks merge into continuous grid lines.
        for c in 0..BLOCK_CELLS {
            self.cell_dot(layout, bx, by, c, 0);
            self.cell_dot(layout, bx, by, 0, c);
        }
        // Alternating sync row and column.
        for c in (2..NDOT + 2).step_by(2) {
            self.cell_dot(layout, bx, by, c, 1);
            self.cell_dot(layout, bx, by, 1, c);
        }
        // The dot matrix itself.
        for row in 0..NDOT {
            for col in 0..NDOT {
                let idx = row * NDOT + col;
                if frame.bytes[idx >> 3] & (1 << (idx & 7)) != 0 {
                    self.cell_dot(layout, bx, by, col + 2, row + 2);
                }
            }
        }
    }

    /// Closes the grid with a trailing guard line after the last block
    /// row and column, so edge blocks see both of their boundaries.
    pub fn draw_closing_lines(&mut self, layout: &PageLayout) {
        let right = layout.border + layout.nx * layout.block_side;
        let bottom = layout.border + layout.ny * layout.block_side;
        let mut x = layout.border;
        while x <= right {
            self.dot(layout, x, bottom);
            x += layout.cellpx;
        }
        let mut y = layout.border;
        while y <= bottom {
            self.dot(layout, right, y);
            y += layout.cellpx;
        }
    }

    /// Dotted frame half a border width outside the active area. The
    /// dotted texture keeps its projection no darker than a guard line.
    pub fn draw_border(&mut self, layout: &PageLayout) {
        let inset = layout.border / 2;
        if inset < layout.cellpx {
            return;
        }
        let left = inset;
        let right = self.width - inset - layout.cellpx;
        let top = inset;
        let bottom = self.height - inset - layout.cellpx;
        let mut x = left;
        while x <= right {
            self.dot(layout, x, top);
            self.dot(layout, x, bottom);
            x += layout.cellpx;
        }
        let mut y = top;
        while y <= bottom {
            self.dot(layout, left, y);
            self.dot(layout, right, y);
            y += layout.cellpx;
        }
    }
}
