//! The `mkappfs` tool builds a package file out of a directory tree on the
//! host filesystem.

use std::env;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::exit;

use appfs::pathfs::{Context, PathFs};
use appfs::{Error, PackageMeta};

/// Command line arguments.
#[derive(Default)]
struct Args {
    prog: String,
    help: bool,
    source_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    name: String,
    version: String,
    description: String,
    author: String,
}

fn parse_args() -> Args {
    let mut args = Args {
        name: "unnamed".to_string(),
        version: "0.0.0".to_string(),
        ..Default::default()
    };
    let mut iter = env::args();
    args.prog = iter.next().unwrap_or_else(|| "mkappfs".to_owned());

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "--name" => args.name = iter.next().unwrap_or_default(),
            "--version" => args.version = iter.next().unwrap_or_default(),
            "--description" => args.description = iter.next().unwrap_or_default(),
            "--author" => args.author = iter.next().unwrap_or_default(),
            _ if args.source_dir.is_none() => args.source_dir = Some(PathBuf::from(arg)),
            _ => args.output = Some(PathBuf::from(arg)),
        }
    }

    args
}

fn print_usage(prog: &str) {
    eprintln!("usage: {prog} [options] <source-dir> <output-file>");
    eprintln!();
    eprintln!("options:");
    eprintln!("  --name <name>               application name");
    eprintln!("  --version <version>         application version");
    eprintln!("  --description <description> application description");
    eprintln!("  --author <author>           application author");
    eprintln!("  -h, --help                  print this help");
}

/// Recursively copies the contents of `src` (a host directory) into the
/// package at `dst_path`, relative to the package's root.
fn ingest_dir(fs: &PathFs, host_dir: &Path, dst_path: &str) -> Result<(), Error> {
    let mut entries: Vec<_> = fs::read_dir(host_dir)
        .map_err(Error::Io)?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => {
                log::warn!("skipping non-UTF-8 entry {:?}", entry.path());
                continue;
            }
        };
        let child_dst = format!("{}/{}", dst_path.trim_end_matches('/'), name);
        let ctx = Context {
            uid: meta.uid(),
            gid: meta.gid(),
        };
        let mode = meta.permissions().mode();

        if meta.is_dir() {
            fs.make_directory(ctx, &child_dst, mode)?;
            ingest_dir(fs, &entry.path(), &child_dst)?;
        } else if meta.file_type().is_symlink() {
            let target = fs::read_link(entry.path()).map_err(Error::Io)?;
            fs.symbolic_link(ctx, &child_dst, target.to_string_lossy().as_bytes())?;
        } else if meta.is_file() {
            let id = fs.create_file(ctx, &child_dst, mode)?;
            let contents = fs::read(entry.path()).map_err(Error::Io)?;
            let stream = fs.open(&child_dst)?;
            let _ = id;
            stream.write(&contents)?;
        } else {
            log::warn!("skipping special file {:?}", entry.path());
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = parse_args();

    if args.help || args.source_dir.is_none() || args.output.is_none() {
        print_usage(&args.prog);
        exit(if args.help { 0 } else { 1 });
    }

    let source_dir = args.source_dir.unwrap();
    let output = args.output.unwrap();

    let meta = PackageMeta {
        app_name: args.name.into_bytes(),
        app_version: args.version.into_bytes(),
        app_description: args.description.into_bytes(),
        app_author: args.author.into_bytes(),
    };

    let package = match PathFs::create_package(&output, meta) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: cannot create package: {e}", args.prog);
            exit(1);
        }
    };

    if let Err(e) = ingest_dir(&package, &source_dir, "/") {
        eprintln!("{}: {e}", args.prog);
        exit(1);
    }
}
