//! End-to-end print/scan scenarios: every page stays in memory, going
//! through the full raster synthesis and grid-recognition pipeline.

use paperback::paperback::{
    job::{DecodeJob, EncodeEvent, EncodeJob, PageImage},
    printer::PageLayout,
    Bitmap, CodecError, EncodeOptions, NDATA,
};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

fn small_options(redundancy: u32) -> EncodeOptions {
    EncodeOptions {
        dpi: 200,
        redundancy,
        compress: 0,
        printborder: false,
        paper_width1000: 4000,
        paper_height1000: 4000,
        ..EncodeOptions::default()
    }
}

fn encode_pages(name: &str, bytes: &[u8], options: &EncodeOptions) -> Vec<PageImage> {
    let job = EncodeJob::new(name, bytes.to_vec(), 1_700_000_000_000, options.clone());
    let mut pages = Vec::new();
    for event in job {
        if let EncodeEvent::Page(page) = event.expect("encode step") {
            pages.push(page);
        }
    }
    pages
}

fn to_bitmap(page: &PageImage) -> Bitmap {
    Bitmap::new(page.width, page.height, page.pixels.clone()).unwrap()
}

struct DecodeTotals {
    placed: usize,
    badblocks: usize,
    recovered: usize,
    restoredbytes: usize,
    files: Vec<(String, Result<Vec<u8>, CodecError>)>,
}

fn decode_bitmaps(bitmaps: &[Bitmap], password: Option<&str>) -> DecodeTotals {
    let mut job = DecodeJob::new(password.map(|p| p.to_string()));
    let mut totals = DecodeTotals {
        placed: 0,
        badblocks: 0,
        recovered: 0,
        restoredbytes: 0,
        files: Vec::new(),
    };
    for bmp in bitmaps {
        let report = job.feed_page(bmp).expect("page decode");
        totals.placed += report.placed;
        totals.badblocks += report.badblocks;
        totals.recovered += report.recovered;
        totals.restoredbytes += report.restoredbytes;
        for (name, result) in report.completed {
            totals.files.push((name, result.map(|f| f.bytes)));
        }
    }
    totals
}

fn roundtrip(name: &str, bytes: &[u8], options: &EncodeOptions) -> DecodeTotals {
    let pages = encode_pages(name, bytes, options);
    let bitmaps: Vec<Bitmap> = pages.iter().map(to_bitmap).collect();
    decode_bitmaps(&bitmaps, options.password.as_deref())
}

#[test]
fn hello_world_on_one_page() {
    let options = small_options(5);
    let pages = encode_pages("hello.txt", b"Hello world", &options);
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].name, "hello");

    let totals = decode_bitmaps(&[to_bitmap(&pages[0])], None);
    assert_eq!(totals.badblocks, 0);
    let (name, result) = &totals.files[0];
    assert_eq!(name, "hello.txt");
    assert_eq!(result.as_ref().unwrap(), b"Hello world");
}

#[test]
fn random_128k_over_several_pages() {
    let mut bytes = vec![0u8; 128 * 1024];
    StdRng::seed_from_u64(2).fill_bytes(&mut bytes);
    let options = EncodeOptions {
        compress: 9,
        paper_width1000: 8000,
        paper_height1000: 8000,
        ..small_options(5)
    };
    let layout = PageLayout::compute(&options).unwrap();
    let nblock = bytes.len().div_ceil(NDATA);

    let pages = encode_pages("noise.bin", &bytes, &options);
    assert_eq!(pages.len(), bytes.len().div_ceil(layout.pagesize));
    assert!(pages
        .iter()
        .enumerate()
        .all(|(i, p)| p.name == format!("noise_{:04}", i + 1)));

    let bitmaps: Vec<Bitmap> = pages.iter().map(to_bitmap).collect();
    let totals = decode_bitmaps(&bitmaps, None);
    assert_eq!(totals.placed, nblock);
    assert_eq!(totals.badblocks, 0);
    assert_eq!(totals.files.len(), 1);
    assert_eq!(totals.files[0].1.as_ref().unwrap(), &bytes);
}

#[test]
fn wrong_password_is_rejected() {
    let mut bytes = vec![0u8; 4096];
    StdRng::seed_from_u64(3).fill_bytes(&mut bytes);
    let mut options = small_options(2);
    options.password = Some("correct horse battery staple".into());

    let pages = encode_pages("secret.bin", &bytes, &options);
    let bitmaps: Vec<Bitmap> = pages.iter().map(to_bitmap).collect();

    let totals = decode_bitmaps(&bitmaps, Some("correct horse battery stapler"));
    assert_eq!(totals.files.len(), 1);
    assert_eq!(totals.files[0].1, Err(CodecError::BadPassword));

    let totals = decode_bitmaps(&bitmaps, Some("correct horse battery staple"));
    assert_eq!(totals.files[0].1.as_ref().unwrap(), &bytes);
}

/// Paints white over `count` random dot positions inside the matrix of
/// the block cell at (bx, by); the sync ring is left alone.
fn damage_block(
    bmp: &mut Bitmap,
    layout: &PageLayout,
    bx: usize,
    by: usize,
    count: usize,
    rng: &mut StdRng,
) {
    for _ in 0..count {
        let col = rng.gen_range(2..34usize);
        let row = rng.gen_range(2..34usize);
        let x0 = layout.border + bx * layout.block_side + col * layout.cellpx;
        let y0 = layout.border + by * layout.block_side + row * layout.cellpx;
        for dy in 0..layout.cellpx {
            for dx in 0..layout.cellpx {
                bmp.pixels[(y0 + dy) * bmp.width + x0 + dx] = 255;
            }
        }
    }
}

#[test]
fn scattered_damage_is_repaired_by_rs() {
    let mut bytes = vec![0u8; 2048];
    StdRng::seed_from_u64(4).fill_bytes(&mut bytes);
    let options = small_options(2);
    let layout = PageLayout::compute(&options).unwrap();

    let pages = encode_pages("damaged.bin", &bytes, &options);
    assert_eq!(pages.len(), 1);
    let mut bmp = to_bitmap(&pages[0]);
    let mut rng = StdRng::seed_from_u64(5);
    for by in 0..layout.ny {
        for bx in 0..layout.nx {
            damage_block(&mut bmp, &layout, bx, by, 8, &mut rng);
        }
    }

    let totals = decode_bitmaps(&[bmp], None);
    assert!(totals.restoredbytes > 0);
    assert_eq!(totals.files.len(), 1);
    assert_eq!(totals.files[0].1.as_ref().unwrap(), &bytes);
}

#[test]
fn one_erased_block_per_group_recovers() {
    let options = small_options(2);
    let layout = PageLayout::compute(&options).unwrap();
    // Fill the page exactly so every group carries real data.
    let mut bytes = vec![0u8; layout.pagesize];
    let mut rng = StdRng::seed_from_u64(6);
    rng.fill_bytes(&mut bytes);

    let pages = encode_pages("groups.bin", &bytes, &options);
    assert_eq!(pages.len(), 1);
    let mut bmp = to_bitmap(&pages[0]);

    // Obliterate one random member of every group: the data block for
    // group i, member j sits at cell j * (gpp + 1) + (i + 1).
    let gpp = layout.groups_per_page;
    for group in 0..gpp {
        let member = rng.gen_range(0..layout.redundancy);
        let k = member * (gpp + 1) + group + 1;
        let (bx, by) = (k % layout.nx, k / layout.nx);
        damage_block(&mut bmp, &layout, bx, by, 400, &mut rng);
    }

    let totals = decode_bitmaps(&[bmp], None);
    assert_eq!(totals.recovered, gpp);
    assert_eq!(totals.files.len(), 1);
    assert_eq!(totals.files[0].1.as_ref().unwrap(), &bytes);
}

/// Bilinear rotation around the page center onto a white canvas.
fn rotate(bmp: &Bitmap, degrees: f64) -> Bitmap {
    let (w, h) = (bmp.width, bmp.height);
    let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
    let (sin, cos) = degrees.to_radians().sin_cos();
    let mut pixels = vec![255u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let sx = cx + dx * cos - dy * sin;
            let sy = cy + dx * sin + dy * cos;
            if sx < 0.0 || sy < 0.0 || sx >= (w - 1) as f64 || sy >= (h - 1) as f64 {
                continue;
            }
            let (x0, y0) = (sx.floor() as usize, sy.floor() as usize);
            let (fx, fy) = (sx - x0 as f64, sy - y0 as f64);
            let p = |xx: usize, yy: usize| bmp.pixels[yy * w + xx] as f64;
            let v = p(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + p(x0 + 1, y0) * fx * (1.0 - fy)
                + p(x0, y0 + 1) * (1.0 - fx) * fy
                + p(x0 + 1, y0 + 1) * fx * fy;
            pixels[y * w + x] = v.round() as u8;
        }
    }
    Bitmap::new(w, h, pixels).unwrap()
}

#[test]
fn small_rotation_decodes_large_rotation_fails() {
    let mut bytes = vec![0u8; 1024];
    StdRng::seed_from_u64(7).fill_bytes(&mut bytes);
    // A coarser raster tolerates resampling loss better.
    let options = EncodeOptions {
        dpi: 300,
        ..small_options(2)
    };

    let pages = encode_pages("tilted.bin", &bytes, &options);
    let upright = to_bitmap(&pages[0]);

    let tilted = rotate(&upright, 2.0);
    let totals = decode_bitmaps(&[tilted], None);
    assert_eq!(totals.files.len(), 1, "2 degree tilt must decode");
    assert_eq!(totals.files[0].1.as_ref().unwrap(), &bytes);

    let mut job = DecodeJob::new(None);
    let twisted = rotate(&upright, 10.0);
    match job.feed_page(&twisted) {
        Err(CodecError::GridNotFound) => {}
        Ok(report) => assert!(
            report.file.is_none(),
            "10 degree tilt must not lock onto the grid"
        ),
        Err(e) => panic!("unexpected error: {e}"),
    }
}

#[test]
fn boundary_sizes_roundtrip() {
    let options = small_options(2);
    let layout = PageLayout::compute(&options).unwrap();
    let pagesize = layout.pagesize;
    let sizes = [
        0,
        1,
        NDATA - 1,
        NDATA,
        NDATA + 1,
        pagesize - 1,
        pagesize,
        pagesize + 1,
        2 * pagesize,
    ];
    let mut rng = StdRng::seed_from_u64(8);
    for size in sizes {
        let mut bytes = vec![0u8; size];
        rng.fill_bytes(&mut bytes);
        let totals = roundtrip("size.bin", &bytes, &options);
        assert_eq!(totals.files.len(), 1, "size {size}");
        assert_eq!(
            totals.files[0].1.as_ref().unwrap(),
            &bytes,
            "size {size} mismatch"
        );
    }
}

#[test]
fn printed_border_does_not_confuse_the_scanner() {
    let mut bytes = vec![0u8; 1500];
    StdRng::seed_from_u64(9).fill_bytes(&mut bytes);
    let mut options = small_options(5);
    options.printborder = true;
    let totals = roundtrip("framed.bin", &bytes, &options);
    assert_eq!(totals.badblocks, 0);
    assert_eq!(totals.files[0].1.as_ref().unwrap(), &bytes);
}

#[test]
fn dotpercent_extremes_roundtrip() {
    let mut bytes = vec![0u8; 800];
    StdRng::seed_from_u64(10).fill_bytes(&mut bytes);
    for dotpercent in [50u32, 100] {
        let options = EncodeOptions {
            dotpercent,
            ..small_options(2)
        };
        let totals = roundtrip("dots.bin", &bytes, &options);
        assert_eq!(
            totals.files[0].1.as_ref().unwrap(),
            &bytes,
            "dotpercent {dotpercent}"
        );
    }
}

#[test]
fn compressed_text_roundtrips() {
    let bytes = b"All work and no play makes Jack a dull boy. ".repeat(500);
    let options = EncodeOptions {
        compress: 9,
        ..small_options(2)
    };
    let totals = roundtrip("play.txt", &bytes, &options);
    assert_eq!(totals.files[0].1.as_ref().unwrap(), &bytes);
}
