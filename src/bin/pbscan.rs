use std::{cmp::Ordering, fs, path::PathBuf};

use clap::Parser;
use paperback::paperback::{job::DecodeJob, Bitmap};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(about = "Decode scanned dot-grid pages back into files")]
struct Arguments {
    #[arg(short = 'v', action = clap::ArgAction::Count, help = "verbose level")]
    verbose: u8,

    #[arg(long = "no-color", action = clap::ArgAction::SetFalse)]
    color: bool,

    #[arg(long, help = "password for encrypted pages")]
    password: Option<String>,

    #[arg(long, action = clap::ArgAction::SetTrue,
          help = "search every shift and dot size for the cleanest read")]
    best: bool,

    #[arg(short = 'o', long = "output", default_value = ".", help = "output directory")]
    output: PathBuf,

    #[arg(help = "scanned page images, any order", value_name = "PAGE", required = true)]
    pages: Vec<PathBuf>,
}

/// Orders file names so that page_2 sorts before page_10.
fn numeric_collation(a: &str, b: &str) -> Ordering {
    let mut ca = a.chars().peekable();
    let mut cb = b.chars().peekable();
    loop {
        match (ca.peek().copied(), cb.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let mut na = 0u64;
                while let Some(d) = ca.peek().and_then(|c| c.to_digit(10)) {
                    na = na * 10 + d as u64;
                    ca.next();
                }
                let mut nb = 0u64;
                while let Some(d) = cb.peek().and_then(|c| c.to_digit(10)) {
                    nb = nb * 10 + d as u64;
                    cb.next();
                }
                match na.cmp(&nb) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            (Some(x), Some(y)) => {
                match x.cmp(&y) {
                    Ordering::Equal => {
                        ca.next();
                        cb.next();
                    }
                    other => return other,
                }
            }
        }
    }
}

fn main() {
    let args = Arguments::parse();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .with_ansi(args.color)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to setup Logger");

    let mut pages = args.pages.clone();
    pages.sort_by(|a, b| {
        numeric_collation(&a.to_string_lossy(), &b.to_string_lossy())
    });

    fs::create_dir_all(&args.output).expect("Failed to create output directory");

    let mut job = DecodeJob::new(args.password.clone()).with_best_quality(args.best);
    let mut recovered_files = 0usize;

    for path in &pages {
        let image = match image::open(path) {
            Ok(image) => image.into_luma8(),
            Err(e) => {
                warn!("{}: can't load image: {e}", path.display());
                continue;
            }
        };
        let (width, height) = image.dimensions();
        let bmp = match Bitmap::new(width as usize, height as usize, image.into_raw()) {
            Ok(bmp) => bmp,
            Err(e) => {
                warn!("{}: {e}", path.display());
                continue;
            }
        };

        let report = match job.feed_page(&bmp) {
            Ok(report) => report,
            Err(e) => {
                warn!("{}: {e}", path.display());
                continue;
            }
        };
        info!(
            "{}: page {} of {:?}: {} good, {} bad, {} placed, {} recovered, {} bytes repaired",
            path.display(),
            report.page,
            report.file.as_deref().unwrap_or("<no superblock>"),
            report.goodblocks,
            report.badblocks,
            report.placed,
            report.recovered,
            report.restoredbytes,
        );

        for (name, result) in report.completed {
            match result {
                Ok(file) => {
                    // Only the file name component; paper is not trusted
                    // with directory structure.
                    let safe = PathBuf::from(&file.name);
                    let safe = safe.file_name().expect("empty file name from paper");
                    let out = args.output.join(safe);
                    fs::write(&out, &file.bytes).expect("Can't write decoded file");
                    info!("recovered {} ({} bytes)", out.display(), file.bytes.len());
                    recovered_files += 1;
                }
                Err(e) => {
                    warn!("{name}: {e}");
                }
            }
        }
    }

    for diag in job.unfinished() {
        warn!(
            "{}: incomplete, {}/{} blocks ({} good, {} bad, {} recovered); missing pages {:?}",
            diag.name,
            diag.ndata,
            diag.nblock,
            diag.goodblocks,
            diag.badblocks,
            diag.recoveredblocks,
            diag.missing_pages,
        );
    }
    info!("{recovered_files} file(s) recovered");
}
