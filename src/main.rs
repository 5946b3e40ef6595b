//! salvage CLI
//!
//! One subcommand per pipeline stage, plus commands to browse and edit the
//! resulting file list and copy data off the device.

use clap::{Parser, Subcommand};
use console::style;
use indicatif::HumanDuration;
use ntfs_salvage::logging::{self, LogLevel};
use ntfs_salvage::pipeline::{self, PipelineConfig};
use ntfs_salvage::scanner::{self, ScanConfig};
use ntfs_salvage::{format_filetime, format_size, DiskReader, FileTree, NodeKind};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// salvage - recover files from damaged NTFS volumes
///
/// Stages run in order: scan -> fill -> fix-mft -> complete -> make-filelist.
/// The resulting file list is browsed with ls and copied out with cp.
#[derive(Parser)]
#[command(name = "salvage")]
#[command(version)]
#[command(about = "Recover files from damaged NTFS volumes", long_about = None)]
struct Cli {
    /// Log file (default: salvage.log in the working directory)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Also log debug messages
    #[arg(short, long, global = true)]
    verbose: bool,

    /// No progress bars
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a device for FILE and INDX signatures
    Scan {
        /// Device or image file
        device: PathBuf,

        /// Output scan store
        #[arg(short, long)]
        output: PathBuf,

        /// Window size in MiB
        #[arg(long, default_value = "100")]
        window_mib: usize,
    },

    /// Decode the record behind every scan hit
    Fill {
        device: PathBuf,

        /// Scan store
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Also decode hits not aligned to a sector
        #[arg(long)]
        allow_unaligned: bool,
    },

    /// Rebuild MFT tables and place every record in one
    FixMft {
        /// Filled store
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Resolve names and parents
    Complete {
        device: PathBuf,

        /// Associated store
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Build the file list
    MakeFilelist {
        /// Completed store
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// List a directory of a file list
    Ls {
        filelist: PathBuf,

        /// Path such as /mft0/Users (default: the list of tables)
        #[arg(default_value = "/")]
        path: String,

        /// Show size, modification time and reference
        #[arg(short, long)]
        long: bool,

        /// JSON output
        #[arg(long)]
        json: bool,

        /// List subdirectories too
        #[arg(short, long)]
        recursive: bool,
    },

    /// Copy a file or directory out of the device
    Cp {
        device: PathBuf,
        filelist: PathBuf,

        /// Path in the file list
        path: String,

        /// Host directory to copy into
        dest: PathBuf,
    },

    /// Move or rename a node
    Mv {
        filelist: PathBuf,
        source: String,
        dest: String,

        /// Write the edited list here instead of in place
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Create an empty directory
    Mkdir {
        filelist: PathBuf,
        path: String,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove a node and everything under it
    Rm {
        filelist: PathBuf,
        path: String,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    logging::init(cli.log_file.clone(), level);
    logging::info("MAIN", &format!("salvage {} starting", ntfs_salvage::VERSION));

    let config = PipelineConfig {
        show_progress: !cli.quiet,
        ..Default::default()
    };

    let result = match cli.command {
        Commands::Scan {
            device,
            output,
            window_mib,
        } => cmd_scan(&device, &output, window_mib, &config),

        Commands::Fill {
            device,
            input,
            output,
            allow_unaligned,
        } => cmd_fill(
            &device,
            &input,
            &output,
            &PipelineConfig {
                allow_unaligned,
                ..config
            },
        ),

        Commands::FixMft { input, output } => cmd_fix_mft(&input, &output, &config),

        Commands::Complete {
            device,
            input,
            output,
        } => cmd_complete(&device, &input, &output, &config),

        Commands::MakeFilelist { input, output } => cmd_make_filelist(&input, &output, &config),

        Commands::Ls {
            filelist,
            path,
            long,
            json,
            recursive,
        } => cmd_ls(&filelist, &path, long, json, recursive),

        Commands::Cp {
            device,
            filelist,
            path,
            dest,
        } => cmd_cp(&device, &filelist, &path, &dest),

        Commands::Mv {
            filelist,
            source,
            dest,
            output,
        } => edit(&filelist, output.as_deref(), |tree| {
            tree.move_node(&source, &dest)?;
            Ok(format!("Moved {} to {}", source, dest))
        }),

        Commands::Mkdir {
            filelist,
            path,
            output,
        } => edit(&filelist, output.as_deref(), |tree| {
            let id = tree.make_directory(&path)?;
            Ok(format!("Created {} (node {})", path, id))
        }),

        Commands::Rm {
            filelist,
            path,
            output,
        } => edit(&filelist, output.as_deref(), |tree| {
            let removed = tree.remove(&path)?;
            Ok(format!("Removed {} ({} nodes)", path, removed))
        }),
    };

    if let Err(e) = result {
        logging::error("MAIN", &e.to_string());
        logging::flush();
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }
    logging::flush();
}

fn header(message: String) {
    println!("{} {}", style("→").cyan().bold(), message);
}

fn done(start: Instant) {
    println!();
    println!(
        "{} Done in {}",
        style("✓").green().bold(),
        style(HumanDuration(start.elapsed())).cyan()
    );
}

fn stat(label: &str, value: u64) {
    println!("  {} {}", style(format!("{:<24}", label)).bold(), value);
}

/// Only printed when non-zero, highlighted
fn problem(label: &str, value: u64) {
    if value > 0 {
        println!("  {} {}", style(format!("{:<24}", label)).bold(), style(value).red());
    }
}

/// Warnings a stage left in the log
fn warnings(module: &str) {
    let count = logging::warning_count(module);
    if count > 0 {
        println!(
            "  {} {} (see log)",
            style(format!("{:<24}", "Warnings:")).bold(),
            style(count).yellow()
        );
    }
}

fn cmd_scan(device: &Path, output: &Path, window_mib: usize, config: &PipelineConfig) -> ntfs_salvage::Result<()> {
    let start = Instant::now();
    header(format!("Scanning {}", style(device.display()).yellow()));

    let scan_config = ScanConfig {
        window_size: window_mib.max(1) * 1024 * 1024,
        show_progress: config.show_progress,
        ..Default::default()
    };
    let result = scanner::scan_to_store(device, output, &scan_config)?;

    done(start);
    println!(
        "  {} {}",
        style(format!("{:<24}", "Scanned:")).bold(),
        style(format_size(result.bytes_scanned)).yellow()
    );
    for (signature, positions) in &result.hits {
        stat(&format!("{} hits:", signature), positions.len() as u64);
    }
    Ok(())
}

fn cmd_fill(device: &Path, input: &Path, output: &Path, config: &PipelineConfig) -> ntfs_salvage::Result<()> {
    let start = Instant::now();
    header(format!("Decoding hits of {}", style(input.display()).yellow()));

    let disk = DiskReader::open(device)?;
    let stats = pipeline::run_fill(&disk, input, output, config)?;

    done(start);
    stat("Hits:", stats.hits);
    stat("FILE records:", stats.files);
    stat("INDX blocks:", stats.indexes);
    problem("Unaligned skipped:", stats.unaligned);
    problem("Duplicates:", stats.duplicates);
    problem("Past device end:", stats.truncated);
    problem("Malformed:", stats.malformed);
    problem("Torn sectors:", stats.torn_sectors);
    warnings("FILL");
    Ok(())
}

fn cmd_fix_mft(input: &Path, output: &Path, config: &PipelineConfig) -> ntfs_salvage::Result<()> {
    let start = Instant::now();
    header(format!("Associating records of {}", style(input.display()).yellow()));

    let stats = pipeline::run_fix_mft(input, output, config)?;

    done(start);
    stat("Tables accepted:", stats.mfts_accepted);
    problem("Tables rejected:", stats.mfts_rejected);
    problem("Overlapping bytes:", stats.overlapping_bytes);
    stat("Files placed:", stats.files_resolved);
    problem("Files unplaced:", stats.files_unresolved);
    problem("Files misaligned:", stats.files_misaligned);
    stat("Indexes matched:", stats.indexes_matched);
    problem("Indexes rejected:", stats.indexes_rejected);
    problem("Indexes unmatched:", stats.indexes_unmatched);
    warnings("FIX-MFT");
    Ok(())
}

fn cmd_complete(device: &Path, input: &Path, output: &Path, config: &PipelineConfig) -> ntfs_salvage::Result<()> {
    let start = Instant::now();
    header(format!("Resolving names in {}", style(input.display()).yellow()));

    let disk = DiskReader::open(device)?;
    let stats = pipeline::run_complete(&disk, input, output, config)?;

    done(start);
    stat("Tables:", stats.tables);
    stat("Files emitted:", stats.emitted);
    stat("Roots read from disk:", stats.roots_read);
    stat("Parent fallbacks:", stats.stale_parent_fallbacks);
    problem("Roots missing:", stats.roots_missing);
    problem("Dropped (no table):", stats.without_mft);
    problem("Unnamed:", stats.unnamed);
    problem("Ambiguous:", stats.ambiguous);
    problem("Empty dirs removed:", stats.empty_directories_removed);
    warnings("COMPLETE");
    Ok(())
}

fn cmd_make_filelist(input: &Path, output: &Path, config: &PipelineConfig) -> ntfs_salvage::Result<()> {
    let start = Instant::now();
    header(format!("Building file list from {}", style(input.display()).yellow()));

    let stats = pipeline::run_make_filelist(input, output, config)?;

    done(start);
    stat("Tables:", stats.tables);
    stat("Nodes:", stats.nodes);
    problem("Orphans:", stats.orphans);
    problem("Reparented:", stats.reparented);
    problem("Synthesized roots:", stats.synthesized_roots);
    problem("Duplicate references:", stats.duplicate_references);
    problem("Duplicate roots:", stats.duplicate_roots);
    problem("Dropped (no table):", stats.without_table);
    warnings("FILELIST");
    Ok(())
}

fn cmd_ls(filelist: &Path, path: &str, long: bool, json: bool, recursive: bool) -> ntfs_salvage::Result<()> {
    let tree = FileTree::load(filelist)?;
    let parent = tree.resolve(path)?;

    if let Some(p) = parent {
        if !tree.node(p).is_directory {
            let entries = [(p, 0)];
            return print_listing(&tree, &entries, long, json);
        }
    }

    let entries = tree.walk(parent, recursive);
    print_listing(&tree, &entries, long, json)?;

    if parent.is_none() && long && !json {
        let stats = tree.stats();
        println!();
        stat("Tables:", stats.tables);
        stat("Directories:", stats.total_directories);
        stat("Files:", stats.total_files);
        stat("In Lost+Found:", stats.lost_found_entries);
        println!(
            "  {} {}",
            style(format!("{:<24}", "Total size:")).bold(),
            style(format_size(stats.total_size)).yellow()
        );
    }
    Ok(())
}

fn print_listing(tree: &FileTree, entries: &[(usize, usize)], long: bool, json: bool) -> ntfs_salvage::Result<()> {
    if json {
        let items: Vec<serde_json::Value> = entries
            .iter()
            .map(|&(i, _)| {
                let n = tree.node(i);
                serde_json::json!({
                    "path": tree.path_of(i),
                    "name": n.name,
                    "directory": n.is_directory,
                    "size": n.size,
                    "modified": format_filetime(n.modified),
                    "mft": n.mft_id,
                    "reference": n.reference.to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    for &(i, depth) in entries {
        let n = tree.node(i);
        let indent = "  ".repeat(depth);
        let name = match n.kind {
            NodeKind::Root | NodeKind::LostFound => style(format!("{}/", n.name)).magenta().bold(),
            _ if n.is_directory => style(format!("{}/", n.name)).cyan(),
            _ => style(n.name.clone()),
        };

        if long {
            println!(
                "{} {} {} {}{}",
                style(format!("{:>12}", if n.is_directory { "-".to_string() } else { format_size(n.size) })).yellow(),
                style(format_filetime(n.modified)).dim(),
                style(format!("{:>16}", n.reference.to_string())).dim(),
                indent,
                name
            );
        } else {
            println!("{}{}", indent, name);
        }
    }
    Ok(())
}

fn cmd_cp(device: &Path, filelist: &Path, path: &str, dest: &Path) -> ntfs_salvage::Result<()> {
    let start = Instant::now();
    header(format!("Copying {} to {}", style(path).yellow(), style(dest.display()).yellow()));

    let disk = DiskReader::open(device)?;
    let tree = FileTree::load(filelist)?;
    std::fs::create_dir_all(dest)?;
    let stats = tree.copy_out(&disk, path, dest)?;

    done(start);
    stat("Files:", stats.files);
    stat("Directories:", stats.directories);
    println!(
        "  {} {}",
        style(format!("{:<24}", "Copied:")).bold(),
        style(format_size(stats.bytes)).yellow()
    );
    if stats.sparse_bytes > 0 {
        println!(
            "  {} {}",
            style(format!("{:<24}", "Sparse (zero filled):")).bold(),
            format_size(stats.sparse_bytes)
        );
    }
    Ok(())
}

/// Load a file list, apply one edit, write it back re-ordered
fn edit<F>(filelist: &Path, output: Option<&Path>, apply: F) -> ntfs_salvage::Result<()>
where
    F: FnOnce(&mut FileTree) -> ntfs_salvage::Result<String>,
{
    let mut tree = FileTree::load(filelist)?;
    let message = apply(&mut tree)?;
    let target = output.unwrap_or(filelist);
    let count = tree.save(target)?;

    println!("{} {}", style("✓").green().bold(), message);
    println!("  {} nodes written to {}", count, target.display());
    Ok(())
}
