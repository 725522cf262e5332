//! liviso - edit bootable Ubuntu live ISO and disk images.
//!
//! Attaches the source image, applies an ordered list of customization
//! actions against its layered live filesystem, and repacks a bootable
//! image containing only the changes that were actually made.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};

use liviso::cli::{self, Call};
use liviso::process::SubprocessError;
use liviso::session::Session;
use liviso::{image, preflight};

#[derive(Parser)]
#[command(name = "liviso")]
#[command(about = "Customize bootable Ubuntu live ISO and disk images")]
#[command(after_help = "EXAMPLES:\n  \
    liviso in.iso out.iso --add-cmdline-arg autoinstall persist=false\n  \
    liviso in.iso in.iso --inject-snap ./subiquity_1234.snap\n  \
    liviso in.img /dev/null --setup-rootfs --shell\n\n\
    Run with DEST=/dev/null to apply actions without producing an image.\n\
    Run with DEST=SOURCE to replace the source image in place.")]
struct Cli {
    /// Source image (ISO9660 or raw disk image)
    source: PathBuf,

    /// Destination image; /dev/null to skip repacking, or the source path
    /// to replace it in place
    dest: PathBuf,

    /// Echo every subprocess invocation (session root shown as ${BASE})
    #[arg(long)]
    debug: bool,

    /// Read the action list from a YAML file instead of the command line
    #[arg(long, value_name = "FILE")]
    action_yaml: Option<PathBuf>,

    /// Ordered actions: --<action> [args...] [key=value...]
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    actions: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        report_error(&err);
        std::process::exit(1);
    }
}

fn report_error(err: &anyhow::Error) {
    eprintln!("error: {err:#}");
    if let Some(sub) = err.downcast_ref::<SubprocessError>() {
        if !sub.stdout.is_empty() {
            eprintln!("--- captured stdout ---\n{}", sub.stdout.trim_end());
        }
        if !sub.stderr.is_empty() {
            eprintln!("--- captured stderr ---\n{}", sub.stderr.trim_end());
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let calls = match &cli.action_yaml {
        Some(path) => cli::parse_yaml(path)?,
        None => cli::parse_tokens(&cli.actions)?,
    };
    preflight::check_required_tools()?;

    let skip_repack = cli.dest == Path::new("/dev/null");
    let in_place = !skip_repack && cli.dest == cli.source;
    let dest = if in_place {
        PathBuf::from(format!("{}.new", cli.source.display()))
    } else {
        cli.dest.clone()
    };

    let session = Session::new(&cli.source, cli.debug)?;
    let result = edit(&session, calls, skip_repack, &dest);
    // Teardown runs whatever happened above; in-place renames wait until
    // the loop device on the source is gone.
    session.teardown();
    let repacked = result?;

    if !repacked && !skip_repack {
        println!("no changes were made; not writing an output image");
    }
    if repacked && in_place {
        fs::rename(&dest, &cli.source)
            .with_context(|| format!("renaming {} over the source", dest.display()))?;
        println!("replaced {}", cli.source.display());
    }
    Ok(())
}

fn edit(session: &Session, calls: Vec<Call>, skip_repack: bool, dest: &Path) -> Result<bool> {
    image::open_source(session)?;
    for call in calls {
        println!(
            "running {} with arguments {{{}}}",
            call.spec.name,
            call.args.describe()
        );
        (call.spec.run)(session, &call.args)?;
    }
    if skip_repack {
        println!("destination is /dev/null; not repacking");
        return Ok(false);
    }
    image::repack(session, dest)
}
