//! nufs - inspect and edit a nufs disk image from the command line
//!
//! Every command goes through the same callbacks a mounted image would see,
//! so failures are reported by errno name.
//!
//! Usage:
//!   nufs --image disk.img --format df         # Format a fresh 256-block image
//!   nufs --image disk.img write /hello hi     # Create /hello holding "hi"
//!   nufs --image disk.img -v ls /             # List the root with debug logging

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use log::{LevelFilter, Metadata, Record};
use nufs::io::{FileBlockEmulator, FileBlockEmulatorBuilder};
use nufs::layout::{BLOCK_SIZE, DEFAULT_BLOCK_COUNT, S_IFDIR, S_IFMT};
use nufs::Nufs;
use nufs_fuse::{FuseError, NufsOps, OpResult, Stat};

#[derive(Parser)]
#[command(name = "nufs")]
#[command(about = "Inspect and edit nufs disk images")]
struct Args {
    /// Disk image file
    #[arg(short, long)]
    image: PathBuf,

    /// Image size in 4k blocks
    #[arg(short, long, default_value_t = DEFAULT_BLOCK_COUNT)]
    blocks: usize,

    /// Wipe the image and lay down an empty filesystem first
    #[arg(long)]
    format: bool,

    /// Verbose output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory
    Ls { path: String },
    /// Show the attributes of a file
    Stat { path: String },
    /// Print a file to stdout
    Cat { path: String },
    /// Write DATA (or stdin when omitted) into a file
    Write {
        path: String,
        data: Option<String>,
        #[arg(short, long, default_value_t = 0)]
        offset: i64,
    },
    /// Create an empty regular file
    Touch { path: String },
    /// Create a directory
    Mkdir { path: String },
    /// Remove a file
    Rm { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Bind a second name to a file
    Ln { from: String, to: String },
    /// Rename a file or directory
    Mv { from: String, to: String },
    /// Set the size of a file
    Truncate { path: String, size: i64 },
    /// Show block and inode usage
    Df,
}

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn open_image(
    image: &Path,
    blocks: usize,
    format: bool,
) -> Result<NufsOps<FileBlockEmulator>, FuseError> {
    if format {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(image)?;
        let dev = FileBlockEmulatorBuilder::from(file)
            .with_block_count(blocks)
            .build()?;
        return Ok(NufsOps::new(Nufs::create(dev)?));
    }
    NufsOps::open_image(image, blocks)
}

fn errno_name(errno: i32) -> &'static str {
    match errno {
        libc::ENOENT => "ENOENT",
        libc::ENOTDIR => "ENOTDIR",
        libc::EISDIR => "EISDIR",
        libc::EEXIST => "EEXIST",
        libc::ENOSPC => "ENOSPC",
        libc::EFBIG => "EFBIG",
        libc::EINVAL => "EINVAL",
        libc::ENAMETOOLONG => "ENAMETOOLONG",
        libc::EIO => "EIO",
        _ => "EUNKNOWN",
    }
}

fn kind(st: &Stat) -> char {
    if st.mode & u32::from(S_IFMT) == u32::from(S_IFDIR) {
        'd'
    } else {
        '-'
    }
}

fn run(ops: &NufsOps<FileBlockEmulator>, command: Command) -> OpResult<()> {
    match command {
        Command::Ls { path } => {
            for (name, st) in ops.readdir(&path)? {
                println!(
                    "{}{:04o} {:>3} {:>5} {:>5} {}",
                    kind(&st),
                    st.mode & 0o7777,
                    st.nlink,
                    st.ino,
                    st.size,
                    name
                );
            }
        }
        Command::Stat { path } => {
            let st = ops.getattr(&path)?;
            println!("  File: {}", path);
            println!(" Inode: {}  Links: {}", st.ino, st.nlink);
            println!("  Mode: {:06o}  Size: {}", st.mode, st.size);
        }
        Command::Cat { path } => {
            let size = ops.getattr(&path)?.size as usize;
            let mut buf = vec![0; size];
            let n = ops.read(&path, &mut buf, 0)?;
            io::stdout()
                .write_all(&buf[..n])
                .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        }
        Command::Write { path, data, offset } => {
            let data = match data {
                Some(data) => data.into_bytes(),
                None => {
                    let mut buf = Vec::with_capacity(BLOCK_SIZE);
                    io::stdin()
                        .read_to_end(&mut buf)
                        .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
                    buf
                }
            };
            let n = ops.write(&path, &data, offset)?;
            if n < data.len() {
                eprintln!("nufs: {}: wrote {} of {} bytes", path, n, data.len());
            }
        }
        Command::Touch { path } => ops.mknod(&path, 0o644)?,
        Command::Mkdir { path } => ops.mkdir(&path, 0o755)?,
        Command::Rm { path } => ops.unlink(&path)?,
        Command::Rmdir { path } => ops.rmdir(&path)?,
        Command::Ln { from, to } => ops.link(&from, &to)?,
        Command::Mv { from, to } => ops.rename(&from, &to)?,
        Command::Truncate { path, size } => ops.truncate(&path, size)?,
        Command::Df => {
            let st = ops.statfs("/")?;
            println!("{:>10} {:>8} {:>8} {:>8}", "", "total", "used", "free");
            println!(
                "{:>10} {:>8} {:>8} {:>8}",
                "blocks",
                st.blocks,
                st.blocks - st.bfree,
                st.bfree
            );
            println!(
                "{:>10} {:>8} {:>8} {:>8}",
                "inodes",
                st.files,
                st.files - st.ffree,
                st.ffree
            );
        }
    }
    Ok(())
}

fn main() {
    let Args {
        image,
        blocks,
        format,
        verbose,
        command,
    } = Args::parse();
    init_logging(verbose);

    let ops = match open_image(&image, blocks, format) {
        Ok(ops) => ops,
        Err(e) => {
            eprintln!("nufs: {}: {}", image.display(), e);
            process::exit(1);
        }
    };

    let status = match run(&ops, command) {
        Ok(()) => 0,
        Err(errno) => {
            eprintln!("nufs: {} ({})", errno_name(errno), errno);
            1
        }
    };

    if let Err(e) = ops.into_inner().into_device() {
        eprintln!("nufs: {}: {}", image.display(), e);
        process::exit(1);
    }
    process::exit(status);
}
