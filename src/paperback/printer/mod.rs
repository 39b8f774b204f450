pub mod raster;

use super::{CodecError, EncodeOptions, MAX_BITMAP_SIDE, MIN_BITMAP_SIDE, NDATA, NDOT};

/// Cells per block side: the dot matrix plus guard, sync and spacing.
pub const BLOCK_CELLS: usize = NDOT + 3;

/// Everything derived from the paper and raster options; all sizes in
/// pixels unless noted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageLayout {
    pub width: usize,
    pub height: usize,
    pub border: usize,
    /// Side of one cell; dot marks occupy `dotsize` of it.
    pub cellpx: usize,
    pub dotsize: usize,
    pub block_side: usize,
    /// Blocks per page, horizontally and vertically.
    pub nx: usize,
    pub ny: usize,
    pub redundancy: usize,
    pub groups_per_page: usize,
    /// Bytes of stream represented on one page.
    pub pagesize: usize,
}

#[inline]
fn round_div(a: u32, b: u32) -> u32 {
    (a + b / 2) / b
}

impl PageLayout {
    pub fn compute(options: &EncodeOptions) -> Result<PageLayout, CodecError> {
        options.validate()?;

        let width = round_div(options.paper_width1000 * options.dpi, 1000) as usize;
        let height = round_div(options.paper_height1000 * options.dpi, 1000) as usize;
        if width < MIN_BITMAP_SIDE
            || width > MAX_BITMAP_SIDE
            || height < MIN_BITMAP_SIDE
            || height > MAX_BITMAP_SIDE
        {
            return Err(CodecError::InvalidParameter {
                name: "paper size at this dpi",
                value: width as i64,
            });
        }

        let cellpx = (round_div(options.dpi, 120) as usize).max(2);
        let dotsize = (round_div(cellpx as u32 * options.dotpercent, 100) as usize).max(1);
        let block_side = BLOCK_CELLS * cellpx;
        let border = (options.dpi / 6) as usize;

        let nx = (width - 2 * border) / block_side;
        let ny = (height - 2 * border) / block_side;
        let redundancy = options.redundancy as usize;
        if nx * ny < 2 * (redundancy + 1) {
            return Err(CodecError::InvalidParameter {
                name: "paper too small for this redundancy",
                value: (nx * ny) as i64,
            });
        }

        let groups_per_page = (nx * ny - (redundancy + 1)) / (redundancy + 1);
        let pagesize = groups_per_page * redundancy * NDATA;

        Ok(PageLayout {
            width,
            height,
            border,
            cellpx,
            dotsize,
            block_side,
            nx,
            ny,
            redundancy,
            groups_per_page,
            pagesize,
        })
    }

    /// Bytes of stream covered by one redundancy group.
    pub fn group_bytes(&self) -> usize {
        self.redundancy * NDATA
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn options(dpi: u32, redundancy: u32) -> EncodeOptions {
        EncodeOptions {
            dpi,
            redundancy,
            ..EncodeOptions::default()
        }
    }

    #[test]
    fn a4_at_200dpi() {
        let layout = PageLayout::compute(&options(200, 5)).unwrap();
        assert_eq!(layout.width, 1654);
        assert_eq!(layout.height, 2338);
        assert_eq!(layout.cellpx, 2);
        assert_eq!(layout.block_side, 70);
        assert_eq!(layout.pagesize, layout.groups_per_page * 5 * NDATA);
    }

    #[test]
    fn cell_never_below_two_pixels() {
        let layout = PageLayout::compute(&options(40, 2)).unwrap();
        assert_eq!(layout.cellpx, 2);
        let layout = PageLayout::compute(&options(600, 2)).unwrap();
        assert_eq!(layout.cellpx, 5);
    }

    #[test]
    fn grid_accounts_for_super_and_parity_rows() {
        for redundancy in [2u32, 10] {
            for dpi in [40u32, 200, 600] {
                let layout = PageLayout::compute(&options(dpi, redundancy)).unwrap();
                let used = (layout.redundancy + 1) * (layout.groups_per_page + 1);
                assert!(layout.nx * layout.ny >= used, "dpi {dpi} red {redundancy}");
                assert_eq!(
                    layout.pagesize,
                    layout.groups_per_page * layout.redundancy * NDATA
                );
            }
        }
    }

    #[test]
    fn dotpercent_extremes() {
        for dotpercent in [50u32, 100] {
            let opts = EncodeOptions {
                dotpercent,
                ..EncodeOptions::default()
            };
            let layout = PageLayout::compute(&opts).unwrap();
            assert!(layout.dotsize >= 1 && layout.dotsize <= layout.cellpx);
        }
    }

    #[test]
    fn tiny_paper_rejected() {
        let opts = EncodeOptions {
            paper_width1000: 1000,
            paper_height1000: 1000,
            ..EncodeOptions::default()
        };
        assert!(PageLayout::compute(&opts).is_err());
    }
}
