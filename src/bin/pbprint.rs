use std::{
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use image::GrayImage;
use indicatif::{ProgressBar, ProgressStyle};
use paperback::paperback::{
    job::{EncodeEvent, EncodeJob},
    EncodeOptions,
};
use tracing::{debug, info, Level};

#[derive(Parser, Debug)]
#[command(about = "Encode a file into printable dot-grid pages")]
struct Arguments {
    #[arg(short = 'v', action = clap::ArgAction::Count, help = "verbose level")]
    verbose: u8,

    #[arg(long = "no-color", action = clap::ArgAction::SetFalse)]
    color: bool,

    #[arg(long, default_value_t = 200, help = "raster density, dots per inch")]
    dpi: u32,

    #[arg(long = "dot-percent", default_value_t = 70)]
    dotpercent: u32,

    #[arg(long, default_value_t = 5, help = "data blocks per parity block")]
    redundancy: u32,

    #[arg(long, default_value_t = 9, help = "gzip level, 0 disables")]
    compress: u32,

    #[arg(long, help = "encrypt pages with this password")]
    password: Option<String>,

    #[arg(long = "no-border", action = clap::ArgAction::SetFalse)]
    printborder: bool,

    #[arg(long = "paper-width", default_value_t = 8270, help = "paper width, 1/1000 inch")]
    paper_width1000: u32,

    #[arg(long = "paper-height", default_value_t = 11690, help = "paper height, 1/1000 inch")]
    paper_height1000: u32,

    #[arg(short = 'o', long = "output", default_value = ".", help = "output directory")]
    output: PathBuf,

    #[arg(help = "file to put on paper", value_name = "FILE")]
    file: PathBuf,
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

    let bytes = fs::read(&args.file).expect("Can't read input file");
    let name = args
        .file
        .file_name()
        .expect("Input path has no file name")
        .to_string_lossy()
        .into_owned();
    let mtime_ms = fs::metadata(&args.file)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_millis() as i64
        });

    fs::create_dir_all(&args.output).expect("Failed to create output directory");

    let options = EncodeOptions {
        dpi: args.dpi,
        dotpercent: args.dotpercent,
        redundancy: args.redundancy,
        compress: args.compress,
        password: args.password.clone(),
        printborder: args.printborder,
        paper_width1000: args.paper_width1000,
        paper_height1000: args.paper_height1000,
    };

    let job = EncodeJob::new(&name, bytes, mtime_ms, options);
    let mut bar: Option<ProgressBar> = None;
    let mut pages = 0usize;

    for event in job {
        match event.expect("Encoding failed") {
            EncodeEvent::Progress { stage, percent } => {
                debug!("{stage:?}: {percent}%");
            }
            EncodeEvent::Page(page) => {
                if bar.is_none() && args.verbose == 0 && page.npages > 1 {
                    let b = ProgressBar::new(page.npages as u64);
                    b.set_style(
                        ProgressStyle::with_template("[{bar:40}] {pos}/{len} pages")
                            .unwrap()
                            .progress_chars("=> "),
                    );
                    bar = Some(b);
                }
                let path = args.output.join(format!("{}.png", page.name));
                let img = GrayImage::from_raw(page.width as u32, page.height as u32, page.pixels)
                    .expect("Page buffer size mismatch");
                img.save(&path).expect("Can't write page image");
                pages += 1;
                if let Some(b) = &bar {
                    b.inc(1);
                } else {
                    info!("wrote {}", path.display());
                }
            }
        }
    }
    if let Some(b) = bar {
        b.finish();
    }
    info!("{pages} page(s) written to {}", args.output.display());
}
