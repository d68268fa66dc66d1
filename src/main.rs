use anyhow::Result;
use clap::Parser;
use pkgcheck::commands;
use pkgcheck::config::{CHECKOUT_SOURCE_TYPE, DEFAULT_CRAN_URL, REGISTRY_SOURCE_TYPE, WorkerConfig};
use pkgcheck::messages::{PackageReference, ResultMessage};
use pkgcheck::runtime::{RealRuntime, Runtime};
use pkgcheck::version::Version;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// pkgcheck - distributed package install and check runner
///
/// Workers resolve, install and check R packages from CRAN-like and SVN
/// repositories; the coordinator commands plan check tasks and merge the
/// results into a revision history.
///
/// Examples:
///   pkgcheck check zoo                  # Check zoo from CRAN right away
///   pkgcheck add-context release        # Start a history for "release"
///   pkgcheck plan 1 zoo lattice         # Queue checks in the spool
///   pkgcheck worker                     # Work through the spool
///   pkgcheck reconcile                  # Merge spooled results
#[derive(Parser, Debug)]
#[command(author, version = env!("PKGCHECK_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Root directory for libraries, caches, spool and history
    #[arg(long = "root", short = 'r', env = "PKGCHECK_ROOT", value_name = "PATH", global = true)]
    pub root: Option<PathBuf>,

    /// CRAN mirror serving src/contrib
    #[arg(long = "cran-url", env = "PKGCHECK_CRAN_URL", value_name = "URL", default_value = DEFAULT_CRAN_URL, global = true)]
    pub cran_url: String,

    /// R executable used to install and check packages
    #[arg(long = "r", env = "PKGCHECK_R", value_name = "PATH", default_value = "R", global = true)]
    pub r_program: PathBuf,

    /// svn executable used for checkouts
    #[arg(long = "svn", env = "PKGCHECK_SVN", value_name = "PATH", default_value = "svn", global = true)]
    pub svn_program: PathBuf,

    /// Version of the configured R installation
    #[arg(long = "r-version", env = "PKGCHECK_R_VERSION", value_name = "VERSION", default_value = "4.4.1", global = true)]
    pub r_version: Version,

    /// Installer flavor, e.g. "devel"
    #[arg(long, env = "PKGCHECK_FLAVOR", global = true)]
    pub flavor: Option<String>,

    /// Installer architecture, e.g. "x86_64"
    #[arg(long, env = "PKGCHECK_ARCH", global = true)]
    pub architecture: Option<String>,

    /// Concurrent checks per worker
    #[arg(long = "pool-size", env = "PKGCHECK_POOL_SIZE", default_value_t = 2, global = true)]
    pub pool_size: usize,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a worker over the spool
    Worker(WorkerArgs),

    /// Check a single package and print the result
    Check(CheckArgs),

    /// Create a coordinator context
    AddContext(AddContextArgs),

    /// Queue check tasks for packages of a context
    Plan(PlanArgs),

    /// Merge spooled results into the history
    Reconcile,
}

#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    /// Task consumers pulling from the spool
    #[arg(long, env = "PKGCHECK_CONSUMERS", default_value_t = 1)]
    pub consumers: usize,

    /// Keep polling the spool every SECONDS instead of exiting when empty
    #[arg(long, value_name = "SECONDS")]
    pub poll: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct CheckArgs {
    /// Package name
    #[arg(value_name = "PACKAGE")]
    pub package: Option<String>,

    /// Check out the package from this SVN URL instead of CRAN
    #[arg(long = "svn-url", value_name = "URL")]
    pub svn_url: Option<String>,

    /// Pin the package version (CRAN) or revision (SVN)
    #[arg(long = "at", value_name = "VERSION")]
    pub version: Option<Version>,
}

#[derive(clap::Args, Debug)]
pub struct AddContextArgs {
    #[arg(value_name = "NAME")]
    pub name: String,
}

#[derive(clap::Args, Debug)]
pub struct PlanArgs {
    #[arg(value_name = "CONTEXT")]
    pub context: u64,

    #[arg(value_name = "PACKAGE", required = true)]
    pub packages: Vec<String>,
}

impl CheckArgs {
    fn reference(&self) -> Result<PackageReference> {
        let reference = match (&self.svn_url, &self.package) {
            (Some(url), name) => PackageReference {
                name: name.clone(),
                ..PackageReference::located(CHECKOUT_SOURCE_TYPE, url)
            },
            (None, Some(name)) => PackageReference::in_repository(name, REGISTRY_SOURCE_TYPE),
            (None, None) => anyhow::bail!("Either a package name or --svn-url is required"),
        };
        Ok(match &self.version {
            Some(version) => reference.at_version(version.clone()),
            None => reference,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let runtime: Arc<dyn Runtime> = Arc::new(RealRuntime);

    let root = match cli.root.clone() {
        Some(root) => root,
        None => WorkerConfig::default_root(runtime.as_ref())?,
    };
    let mut config = WorkerConfig::new(root, cli.r_version.clone());
    config.cran_url = cli.cran_url.clone();
    config.r_program = cli.r_program.clone();
    config.svn_program = cli.svn_program.clone();
    config.flavor = cli.flavor.clone();
    config.architecture = cli.architecture.clone();
    config.pool_size = cli.pool_size;

    match cli.command {
        Commands::Worker(args) => {
            config.consumers = args.consumers;
            let poll = args.poll.map(Duration::from_secs);
            let stats = commands::worker(runtime, &config, poll).await?;
            println!(
                "{} task(s) received, {} malformed, {} result(s) published",
                stats.received, stats.malformed, stats.published
            );
        }
        Commands::Check(args) => {
            let result = commands::check(runtime, &config, args.reference()?).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let ResultMessage::Exception(exception) = result {
                anyhow::bail!("Check of {} failed: {}", exception.package.name, exception.error);
            }
        }
        Commands::AddContext(args) => {
            let context = commands::add_context(runtime, &config, &args.name)?;
            println!("{}\t{}", context.id, context.name);
        }
        Commands::Plan(args) => {
            for path in commands::plan(runtime, &config, args.context, &args.packages)? {
                println!("{}", path.display());
            }
        }
        Commands::Reconcile => {
            for (package, outcome) in commands::reconcile(runtime, &config).await? {
                println!("{package}\t{outcome:?}");
            }
        }
    }
    Ok(())
}
