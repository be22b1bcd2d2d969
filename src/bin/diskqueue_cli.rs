use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diskqueue::config::DEFAULT_SEGMENT_CAPACITY;
use diskqueue::dir_lock::read_lock_pid;
use diskqueue::segment::{discover_segments, sort_segments};
use diskqueue::{inspect_segment, DiskQueue, OverflowPolicy, QueueConfig};

#[derive(Parser)]
#[command(name = "diskqueue-cli", version, about = "Disk queue tooling")]
struct Cli {
    /// Queue directory
    queue_path: PathBuf,

    /// Segment capacity in bytes
    #[arg(long, default_value_t = DEFAULT_SEGMENT_CAPACITY)]
    capacity: u64,

    /// Overall disk limit in bytes (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    disk_limit: u64,

    /// Refuse new items at the disk limit instead of dropping old segments
    #[arg(long)]
    reject_new: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append each argument as one item
    Push { items: Vec<String> },
    /// Print the front item without consuming it
    Peek,
    /// Print and consume the front item
    Pop,
    /// Print and consume items until the queue is empty
    Drain {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the segment ids
    List,
    /// Per-segment summary, read-only and without taking the lock
    Inspect,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());

    if let Commands::Inspect = cli.command {
        inspect(&cli.queue_path, &mut out)?;
        out.flush()?;
        return Ok(());
    }

    let overflow = if cli.reject_new {
        OverflowPolicy::RejectNew
    } else {
        OverflowPolicy::DropOldest
    };
    let config = QueueConfig::new(cli.capacity, cli.disk_limit).with_overflow(overflow);
    let queue = DiskQueue::new(config);
    queue
        .start(&cli.queue_path)
        .with_context(|| format!("start queue at {}", cli.queue_path.display()))?;

    match cli.command {
        Commands::Push { items } => {
            for item in &items {
                queue
                    .push_back(item.as_bytes())
                    .with_context(|| format!("push {item:?}"))?;
            }
            writeln!(out, "pushed {}", items.len())?;
        }
        Commands::Peek => match queue.front_vec() {
            Some(payload) => print_payload(&mut out, &payload)?,
            None => writeln!(out, "(empty)")?,
        },
        Commands::Pop => match queue.front_vec() {
            Some(payload) => {
                print_payload(&mut out, &payload)?;
                queue.pop_front();
            }
            None => writeln!(out, "(empty)")?,
        },
        Commands::Drain { limit } => {
            let mut count = 0usize;
            while limit.map_or(true, |limit| count < limit) {
                let payload = match queue.front_vec() {
                    Some(payload) => payload,
                    None => break,
                };
                print_payload(&mut out, &payload)?;
                if !queue.pop_front() {
                    break;
                }
                count += 1;
            }
            writeln!(out, "drained {count}")?;
        }
        Commands::List => {
            for id in queue.list() {
                writeln!(out, "{id}")?;
            }
            writeln!(out, "disk usage: {} bytes", queue.disk_usage())?;
        }
        Commands::Inspect => {}
    }

    queue.stop()?;
    out.flush()?;
    Ok(())
}

fn print_payload(out: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    match std::str::from_utf8(payload) {
        Ok(text) => writeln!(out, "{text}"),
        Err(_) => writeln!(out, "<{} bytes> {:02x?}", payload.len(), payload),
    }
}

fn inspect(root: &Path, out: &mut impl Write) -> Result<()> {
    let mut segments = discover_segments(root)
        .with_context(|| format!("scan {}", root.display()))?;
    sort_segments(&mut segments);

    match read_lock_pid(root)? {
        Some(pid) => writeln!(out, "last lock holder pid: {pid}")?,
        None => writeln!(out, "never locked")?,
    }
    writeln!(
        out,
        "{:>10} {:>10} {:>8} {:>8} {:>10} {:>10}  tail",
        "segment", "bytes", "active", "consumed", "payload", "valid"
    )?;
    for segment in &segments {
        let report = inspect_segment(&segment.path(root))
            .with_context(|| format!("inspect segment {}", segment.name))?;
        let header = if report.header.is_some() { "" } else { " (bad header)" };
        writeln!(
            out,
            "{:>10} {:>10} {:>8} {:>8} {:>10} {:>10}  {:?}{header}",
            segment.name,
            report.file_len,
            report.active_items,
            report.consumed_items,
            report.active_bytes,
            report.valid_len,
            report.tail
        )?;
    }
    Ok(())
}
