//! CLI front end for the inode file system: format an in-memory disk
//! image, then run a handful of path operations against it in a single
//! invocation. With the `fuse` feature enabled, `mount` instead hands
//! the file system to a real FUSE mountpoint.

use clap::{Parser, Subcommand};

use ossim::fs::{Filesystem, MemBlockDevice};

/// Small command-line harness for the rufs-style inode file system.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of blocks to format the backing in-memory device with.
    #[arg(long, default_value_t = 4096)]
    blocks: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List directory entries at a path.
    Ls { path: String },
    /// Create a directory.
    Mkdir { path: String },
    /// Remove an empty directory.
    Rmdir { path: String },
    /// Create an empty regular file.
    Touch { path: String },
    /// Print a file's contents to stdout.
    Cat { path: String },
    /// Write stdin's contents to a file (truncating any previous content
    /// at that offset).
    Write { path: String },
    /// Remove a regular file.
    Rm { path: String },
    /// Mount the file system at a real mountpoint via FUSE. Only
    /// available when built with `--features fuse`.
    Mount { mountpoint: String },
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let device = MemBlockDevice::new(args.blocks);
    let fs = Filesystem::mkfs(Box::new(device)).expect("mkfs should succeed on a fresh device");

    match args.command {
        Command::Ls { path } => {
            let entries = fs.readdir(&path).unwrap_or_else(|| panic!("no such directory: {path}"));
            for name in entries {
                println!("{name}");
            }
        }
        Command::Mkdir { path } => {
            fs.mkdir(&path).unwrap_or_else(|e| panic!("mkdir {path} failed: {e}"));
        }
        Command::Rmdir { path } => {
            fs.rmdir(&path).unwrap_or_else(|e| panic!("rmdir {path} failed: {e}"));
        }
        Command::Touch { path } => {
            fs.create(&path).unwrap_or_else(|e| panic!("touch {path} failed: {e}"));
        }
        Command::Cat { path } => {
            let attr = fs.getattr(&path).unwrap_or_else(|| panic!("no such file: {path}"));
            let mut buf = vec![0u8; attr.size as usize];
            fs.read(&path, 0, &mut buf).unwrap_or_else(|e| panic!("read {path} failed: {e}"));
            use std::io::Write as _;
            std::io::stdout().write_all(&buf).expect("stdout write failed");
        }
        Command::Write { path } => {
            use std::io::Read as _;
            let mut data = Vec::new();
            std::io::stdin().read_to_end(&mut data).expect("stdin read failed");
            fs.write(&path, 0, &data).unwrap_or_else(|e| panic!("write {path} failed: {e}"));
        }
        Command::Rm { path } => {
            fs.unlink(&path).unwrap_or_else(|e| panic!("rm {path} failed: {e}"));
        }
        Command::Mount { mountpoint } => mount_command(fs, &mountpoint),
    }
}

#[cfg(feature = "fuse")]
fn mount_command(fs: Filesystem, mountpoint: &str) {
    ossim::fs::mount(fs, std::path::Path::new(mountpoint)).expect("fuse mount failed");
}

#[cfg(not(feature = "fuse"))]
fn mount_command(_fs: Filesystem, _mountpoint: &str) {
    eprintln!("rufs_mount was built without the `fuse` feature; rebuild with --features fuse to mount");
    std::process::exit(1);
}
