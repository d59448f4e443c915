//! imagebake CLI entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use imagebake::logging::{LoggingOptions, init_logging};
use imagebake::request::{SourceSelector, release_path_for};
use imagebake::{BakeSettings, BakeWorkflow, GcloudCli, OutputMode, WorkflowRequest};

/// Bake a machine image with a release installed on it.
#[derive(Parser, Debug)]
#[command(name = "imagebake", version, about)]
struct Cli {
    /// Release name, resolved against the release repository.
    #[arg(long, conflicts_with = "release_path")]
    release: Option<String>,

    /// Full path to the release, e.g. gs://bucket/my_release.
    #[arg(long)]
    release_path: Option<String>,

    /// Name of the image to create. Defaults to the release basename.
    #[arg(long)]
    image: Option<String>,

    /// Project that owns the created image and the prototype instance.
    #[arg(long)]
    image_project: Option<String>,

    /// Exact source image to boot from.
    #[arg(long, conflicts_with = "source_image_family")]
    source_image: Option<String>,

    /// Boot from the newest image whose name starts with this prefix.
    #[arg(long)]
    source_image_family: Option<String>,

    #[arg(long)]
    source_image_project: Option<String>,

    #[arg(long)]
    zone: Option<String>,

    /// Name of the prototype instance.
    #[arg(long)]
    instance_name: Option<String>,

    /// Write a gs:// tarball instead of registering an image.
    #[arg(long)]
    write_tarball_path: Option<String>,

    /// Extra flags passed through to the installer.
    #[arg(long, value_delimiter = ' ', allow_hyphen_values = true)]
    extra_install_flags: Vec<String>,

    /// Install only runtime dependencies, not the release components.
    #[arg(long)]
    nospinnaker: bool,

    /// Skip installing runtime dependencies.
    #[arg(long)]
    nodependencies: bool,

    /// Upgrade the operating system packages before installing.
    #[arg(long)]
    update_os: bool,

    /// Stream the instance serial console while waiting.
    #[arg(long)]
    trace: bool,

    /// JSON settings file.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Directory holding the installer scripts.
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Directory holding the installer helper modules.
    #[arg(long)]
    pylib_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = match &cli.settings {
        Some(path) => BakeSettings::load(path)?,
        None => BakeSettings::default(),
    };
    if let Some(dir) = cli.install_dir {
        settings.installer.install_dir = dir;
    }
    if let Some(dir) = cli.pylib_dir {
        settings.installer.pylib_dir = dir;
    }

    let _log_guard = init_logging(&LoggingOptions {
        log_dir: settings.resolved_log_dir(),
        ..Default::default()
    })?;

    let release_path = match (cli.release, cli.release_path) {
        (Some(name), None) => release_path_for(&settings.release_repository, &name),
        (None, Some(path)) => path,
        _ => bail!("specify either --release or --release-path"),
    };

    let gcloud = GcloudCli::new(&settings.gcloud_binary);
    let project = match cli.image_project {
        Some(project) => project,
        None => gcloud
            .default_project()
            .await
            .context("failed to read the default project")?
            .context("no --image-project given and gcloud has no default project")?,
    };

    let mut request = WorkflowRequest::new(&settings, release_path, project);
    if let Some(image) = cli.image {
        request = request.with_target_image(image);
    }
    if let Some(image) = cli.source_image {
        request = request.with_source(SourceSelector::Image(image));
    } else if let Some(family) = cli.source_image_family {
        request = request.with_source(SourceSelector::Family(family));
    }
    if let Some(project) = cli.source_image_project {
        request.source_image_project = project;
    }
    if let Some(zone) = cli.zone {
        request.zone = zone;
    }
    if let Some(name) = cli.instance_name {
        request = request.with_instance_name(name);
    }
    if let Some(destination) = cli.write_tarball_path {
        request = request.with_output(OutputMode::Tarball { destination });
    }
    request.extra_install_flags = cli.extra_install_flags;
    request.skip_components = cli.nospinnaker;
    request.skip_dependencies = cli.nodependencies;
    request.update_os = cli.update_os;
    request.trace = cli.trace;

    let zone = request.zone.clone();
    let workflow = BakeWorkflow::new(Arc::new(gcloud), settings, request)?;
    let outcome = workflow.run().await?;

    if !outcome.cleanup.is_clean() {
        eprintln!("Warning: some resources could not be removed:");
        for failure in &outcome.cleanup.failures {
            eprintln!("  {failure}");
        }
    }
    println!("{}", outcome.artifact.next_steps(&zone));
    Ok(())
}
