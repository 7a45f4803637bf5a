use anyhow::{Context, Result};
use clap::Parser;
use repogate_digest::{compute_file_digest, Sha256};
use std::path::{Path, PathBuf};

/// Walks a local APT pool and writes a `by-hash/SHA256/<digest>` sidecar
/// next to each indexed file, so a repository mirror can be served
/// through hash-addressed URLs without re-hashing on every request.
#[derive(Parser)]
#[clap(
    name = "apt-hash",
    version,
    about = "Pre-hash an APT repository tree into by-hash/SHA256 sidecars"
)]
struct Args {
    /// Root of the APT pool or dists tree to walk.
    #[clap(value_name = "DIR")]
    root: PathBuf,

    /// Print what would be written without touching the filesystem.
    #[clap(long)]
    dry_run: bool,

    /// Also hash files inside an existing by-hash directory.
    #[clap(long)]
    include_by_hash: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if !args.root.is_dir() {
        anyhow::bail!("{} is not a directory", args.root.display());
    }

    let mut written = 0usize;
    let mut skipped = 0usize;

    for entry in walkdir::WalkDir::new(&args.root)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !args.include_by_hash && is_inside_by_hash(path) {
            continue;
        }

        match hash_and_link(path, args.dry_run).with_context(|| {
            format!("failed to hash {}", path.display())
        })? {
            LinkOutcome::Written(hex) => {
                println!("{}: SHA256 {}", path.display(), hex);
                written += 1;
            }
            LinkOutcome::AlreadyPresent(hex) => {
                println!("{}: SHA256 {} (already present)", path.display(), hex);
                skipped += 1;
            }
        }
    }

    println!("done: {written} written, {skipped} already present");
    Ok(())
}

enum LinkOutcome {
    Written(String),
    AlreadyPresent(String),
}

fn is_inside_by_hash(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str() == "by-hash")
}

/// Hashes `path` and hard-links it into a `by-hash/SHA256/<hex>` sidecar
/// in the same directory, mirroring the layout APT clients expect.
fn hash_and_link(path: &Path, dry_run: bool) -> Result<LinkOutcome> {
    let digest = compute_file_digest::<Sha256>(path)?;
    let hex = format!("{digest:x}");

    let parent = path.parent().context("file has no parent directory")?;
    let by_hash_dir = parent.join("by-hash").join("SHA256");
    let sidecar = by_hash_dir.join(&hex);

    if sidecar.exists() {
        return Ok(LinkOutcome::AlreadyPresent(hex));
    }
    if dry_run {
        return Ok(LinkOutcome::Written(hex));
    }

    std::fs::create_dir_all(&by_hash_dir)
        .with_context(|| format!("failed to create {}", by_hash_dir.display()))?;
    match std::fs::hard_link(path, &sidecar) {
        Ok(()) => {}
        Err(_) => {
            std::fs::copy(path, &sidecar)
                .with_context(|| format!("failed to copy into {}", sidecar.display()))?;
        }
    }

    Ok(LinkOutcome::Written(hex))
}
