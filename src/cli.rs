use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gallery-zip")]
#[command(author, version, about = "Download image galleries into a single ZIP archive", long_about = None)]
pub struct Args {
    /// Strategy file: JSON object mapping domain to extraction rule
    #[arg(short, long, env = "GALLERY_STRATEGIES", default_value = "strategies.json")]
    pub strategies: PathBuf,

    /// Directory holding finished archives and their metadata
    #[arg(short, long, env = "GALLERY_ARCHIVES", default_value = "./archives")]
    pub archives: PathBuf,

    /// Root for temporary job directories (defaults to the system temp dir)
    #[arg(long, env = "GALLERY_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Number of parallel image downloads per gallery
    #[arg(short, long, env = "GALLERY_CONCURRENCY", default_value = "5",
          value_parser = clap::value_parser!(u32).range(1..))]
    pub concurrency: u32,

    /// Minimum images a strategy must yield during discovery
    #[arg(long, env = "GALLERY_MIN_IMAGES", default_value = "5")]
    pub min_images: usize,

    /// HTTP proxy for strategies that require one (e.g., http://127.0.0.1:7890)
    #[arg(long, env = "GALLERY_PROXY")]
    pub proxy: Option<String>,

    /// Base URL under which archives are served
    #[arg(long, env = "GALLERY_PUBLIC_URL", default_value = "http://localhost:8080/files")]
    pub public_url: String,

    /// Identity of the console user
    #[arg(long, env = "GALLERY_USER", default_value = "local")]
    pub user: String,
}
