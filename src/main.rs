use clap::{Parser, Subcommand};
use rrsite::buildsystem::{self, BuildOptions};
use rrsite::config::{self, CONFIG_FILE, SiteConfig};
use rrsite::site::SiteError;
use rrsite::{emit, output, site};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "rrsite")]
#[command(about = "Incremental static site builder with cache-busting resource names")]
#[command(long_about = "\
Incremental static site builder with cache-busting resource names

Every build copies the source tree into a fresh generation directory and only
redoes work whose inputs changed since the last generation. Resources marked
with ?rr are renamed after a hash of their content and everything they
reference, so they can be served with a one-year cache lifetime.

Source structure:

  source/
  ├── config.toml          # Site config (optional; editing it rebuilds everything)
  └── site/
      ├── index.html       # Page → /
      ├── about.md         # Markdown page → /about
      ├── old-page.301     # Redirect → contents name the target
      ├── robots.txt       # Direct file → /robots.txt
      ├── style.css        # Resource, served only when referenced as style.css?rr
      └── img/bg.png

Builds land next to the source in +<name>-builds/:

  build/          # Last complete generation
  building/       # Generation in progress
  building-old/   # Unfinished generation kept for reuse

Set RUST_LOG=rrsite=debug for per-unit logging.

Run 'rrsite gen-config' to generate a documented config.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Source directory
    #[arg(long, default_value = ".", global = true)]
    source: PathBuf,

    /// Directory holding the build generations [default: +<source>-builds next to the source]
    #[arg(long, global = true)]
    builds_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble the site, rewrite resources and promote the new build
    Build,
    /// Assemble the site and check links without touching the build directory
    Check,
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Build => {
            let site_config = config::load_config(&cli.source)?;
            let mut options = build_options(&cli.source)?;
            options.builds_dir = cli.builds_dir.clone();

            let (stats, build_dir) = buildsystem::run(&options, |run| {
                println!("==> Stage 1: Assembling {}", cli.source.display());
                let site = assemble_or_report(run, &site_config)?;
                output::print_site_output(&site);

                println!("==> Stage 2: Rewriting resources");
                let emitted = emit::emit(run, &site)?;
                output::print_emit_output(&emitted);
                let build_dir = run.builds_dir().join(buildsystem::BUILD_DIR);
                Ok::<_, Box<dyn std::error::Error>>((run.stats(), build_dir))
            })?;
            output::print_build_summary(&build_dir, &stats);
        }
        Command::Check => {
            let site_config = config::load_config(&cli.source)?;
            let mut options = build_options(&cli.source)?;
            let scratch = tempfile::Builder::new().prefix("rrsite-check-").tempdir()?;
            options.builds_dir = Some(scratch.path().to_path_buf());

            println!("==> Checking {}", cli.source.display());
            let run = buildsystem::BuildRun::start(&options)?;
            let site = assemble_or_report(&run, &site_config)?;
            output::print_site_output(&site);
            println!("==> Site is valid");
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Assemble, printing the broken-link list before failing on it.
fn assemble_or_report<'run>(
    run: &'run buildsystem::BuildRun,
    site_config: &SiteConfig,
) -> Result<site::Site<'run>, SiteError> {
    site::assemble(run, site_config).inspect_err(|e| {
        if let SiteError::BrokenLinks(broken) = e {
            output::print_broken_links(broken);
        }
    })
}

/// The config file and this executable are the build script: a change to
/// either invalidates every unit.
fn build_options(source: &Path) -> std::io::Result<BuildOptions> {
    let mut options = BuildOptions::new(source);
    let config_file = source.join(CONFIG_FILE);
    if config_file.is_file() {
        options.build_script_sources.push(config_file);
    }
    options.build_script_sources.push(std::env::current_exe()?);
    Ok(options)
}
