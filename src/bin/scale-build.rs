use clap::{Parser, Subcommand};
use scale_build::bootstrap::{hash, BootstrapDir, Variant};
use scale_build::builder::ChrootBuilder;
use scale_build::checkout::checkout_sources;
use scale_build::clean;
use scale_build::config::Config;
use scale_build::epoch::check_epoch;
use scale_build::error::Error;
use scale_build::graph::PackageGraph;
use scale_build::logs::BuildLog;
use scale_build::manifest::Manifest;
use scale_build::package::SourcePackage;
use scale_build::paths::Layout;
use scale_build::preflight::{preflight_check, validate_system_state};
use scale_build::scheduler::Scheduler;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(name = "scale-build", about = "Reproducible TrueNAS SCALE distribution builder")]
struct Args {
    /// Builder root directory.
    #[clap(long, env = "BUILDER_DIR", default_value = ".")]
    builder_dir: PathBuf,
    /// Enable debug logging.
    #[clap(long)]
    debug: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check out all source repositories.
    Checkout,
    /// Build all changed source packages.
    Packages,
    /// Assemble the rootfs update image.
    Update,
    /// Assemble the installation ISO.
    Iso,
    /// Remove log, source and tmp trees.
    Clean,
    /// Run the preflight validations.
    Validate {
        /// Validate the build manifest (default).
        #[clap(long, overrides_with = "no_validate_manifest")]
        validate_manifest: bool,
        /// Skip manifest validation.
        #[clap(long)]
        no_validate_manifest: bool,
        /// Validate the host system state (default).
        #[clap(long, overrides_with = "no_validate_system_state")]
        validate_system_state: bool,
        /// Skip system state validation.
        #[clap(long)]
        no_validate_system_state: bool,
    },
}

fn load_manifest(layout: &Layout) -> Result<Manifest, Error> {
    Manifest::load(&layout.manifest_path())
}

fn cmd_checkout(layout: &Layout, config: &Config) -> Result<(), Error> {
    let manifest = load_manifest(layout)?;
    layout.setup_dirs()?;
    checkout_sources(layout, &manifest, config)
}

fn cmd_packages(layout: &Layout, config: &Config) -> Result<(), Error> {
    let manifest = load_manifest(layout)?;
    preflight_check(layout)?;
    check_epoch(layout, &manifest, config)?;

    let log_dir = layout.log_dir();
    log::info!(
        "Bootstrapping packages chroot [packages] ({})",
        log_dir.join("bootstrap-chroot.log").display()
    );
    {
        let log = BuildLog::to_file(&log_dir.join("bootstrap-chroot.log"))?;
        let client = hash::http_client()?;
        BootstrapDir::new(Variant::Package, layout, &manifest).setup(&client, &log)?;
    }

    // Per-package logs start fresh each run.
    let _ = std::fs::remove_dir_all(layout.pkg_log_dir());
    std::fs::create_dir_all(layout.pkg_log_dir())?;

    let packages = SourcePackage::from_manifest(&manifest);
    for pkg in &packages {
        if !pkg.exists(layout) {
            return Err(Error::Call(format!(
                "Missing sources for {}, did you forget to run checkout?",
                pkg.name
            )));
        }
    }

    let resolver = scale_build::builder::ChrootControlResolver {
        layout,
        config,
        manifest: &manifest,
    };
    let graph = PackageGraph::build(packages, &resolver, &|pkg| pkg.hash_changed(layout))?;

    let runner = ChrootBuilder {
        layout,
        config,
        manifest: &manifest,
    };
    let scheduler = Scheduler::new(&graph, &runner, layout, config.parallel_builds);
    let to_build = scheduler.to_build_names();
    if to_build.is_empty() {
        log::info!("Nothing to build");
        return Ok(());
    }
    log::info!("Building packages: {}", to_build.join(", "));
    scheduler.run()
}

fn cmd_update(layout: &Layout, config: &Config) -> Result<(), Error> {
    let manifest = load_manifest(layout)?;
    preflight_check(layout)?;
    check_epoch(layout, &manifest, config)?;
    let version = scale_build::image::update::build_update(layout, config, &manifest)?;
    log::info!(
        "Update file created at {}",
        layout.update_file_path(&version).display()
    );
    Ok(())
}

fn cmd_iso(layout: &Layout, config: &Config) -> Result<(), Error> {
    let manifest = load_manifest(layout)?;
    preflight_check(layout)?;
    let version = scale_build::image::iso::build_iso(layout, config, &manifest)?;
    log::info!("CD/USB: {}", layout.iso_file_path(&version).display());
    Ok(())
}

fn cmd_validate(
    layout: &Layout,
    validate_manifest: bool,
    system_state: bool,
) -> Result<(), Error> {
    if system_state {
        validate_system_state()?;
        log::debug!("System state validated");
    }
    if validate_manifest {
        load_manifest(layout)?;
        log::debug!("Manifest validated");
    }
    Ok(())
}

pub fn main() -> Result<(), i32> {
    let args = Args::parse();

    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter(
            None,
            if args.debug {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            },
        )
        .init();

    let layout = Layout::new(&args.builder_dir);
    let config = Config::from_env();

    // Recover whatever a previous aborted run left mounted.
    clean::clean_mounts(&layout);

    let result = match args.command {
        Command::Checkout => cmd_checkout(&layout, &config),
        Command::Packages => cmd_packages(&layout, &config),
        Command::Update => cmd_update(&layout, &config),
        Command::Iso => cmd_iso(&layout, &config),
        Command::Clean => clean::complete_cleanup(&layout),
        Command::Validate {
            no_validate_manifest,
            no_validate_system_state,
            ..
        } => cmd_validate(&layout, !no_validate_manifest, !no_validate_system_state),
    };

    match result {
        Ok(()) => {
            log::info!("Success!");
            Ok(())
        }
        Err(e) => {
            log::error!("{}", e);
            clean::clean_mounts(&layout);
            Err(1)
        }
    }
}
