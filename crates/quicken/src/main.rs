use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use quicken_core::elf::ElfImage;
use quicken_core::maps::{MapFlags, Maps, ProcMaps};
use quicken_core::{Arch, QuickenConfig, QutSections, QutTableManager, UnwindMode};
use quicken_utils::{LogFormat, LogLevel, info, init_logging, init_logging_with_level, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Generate, inspect and exercise Quicken unwind tables.
#[derive(Parser, Debug)]
#[command(name = "quicken")]
#[command(version)]
#[command(about = "Generate, inspect and exercise Quicken unwind tables", long_about = None)]
struct Cli
{
    /// Directory holding table files
    #[arg(long, global = true, env = "QUICKEN_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
    /// Log format: pretty, compact or json (defaults to QUICKEN_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
    /// Log level: error, warn, info, debug or trace (defaults to QUICKEN_LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Generate and cache the table of one library
    Generate
    {
        /// Path to the shared library
        library: PathBuf,
        /// File offset of the ELF header (hex with 0x, or decimal)
        #[arg(long, default_value = "0", value_parser = parse_number)]
        offset: u64,
        /// Only write the file, do not load it
        #[arg(long, default_value_t = false)]
        only_save: bool,
    },
    /// Validate a table file and print its layout
    Inspect
    {
        /// Table file to read
        file: PathBuf,
    },
    /// Print the memory maps of a process
    Maps
    {
        /// Process ID (defaults to this process)
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Generate tables for many libraries in parallel
    WarmUp
    {
        /// Libraries to generate; defaults to every executable file mapping of --pid
        libraries: Vec<PathBuf>,
        /// Process whose loaded libraries are warmed up (defaults to this process)
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Unwind this process's own stack and print it
    Backtrace
    {
        /// Unwind mode: fp, dwarf or quicken
        #[arg(long, default_value = "quicken")]
        mode: UnwindMode,
    },
}

fn parse_number(value: &str) -> Result<u64, String>
{
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid number {value:?}: {err}"))
}

fn main()
{
    let cli = Cli::parse();

    let logging = match (cli.log_level, cli.log_format) {
        (None, None) => init_logging(),
        (level, format) => init_logging_with_level(level.unwrap_or(LogLevel::Info), format.unwrap_or(LogFormat::Pretty)),
    };
    let _guard = match logging {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            process::exit(1);
        }
    };

    let result = if matches!(cli.command, Commands::WarmUp { .. }) {
        tokio::runtime::Runtime::new()
            .map_err(Into::into)
            .and_then(|rt| rt.block_on(run_command_async(cli)))
    } else {
        run_command(cli)
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn config(cache_dir: Option<PathBuf>) -> CliResult<QuickenConfig>
{
    let mut config = QuickenConfig::from_env()?;
    if let Some(dir) = cache_dir {
        config.cache_dir = dir;
    }
    config.ensure_cache_dir()?;
    Ok(config)
}

fn run_command(cli: Cli) -> CliResult<()>
{
    match cli.command {
        Commands::Generate {
            library,
            offset,
            only_save,
        } => {
            let config = config(cli.cache_dir)?;
            let arch = ElfImage::open(&library, offset)?.arch();
            let manager = QutTableManager::new(&config.cache_dir, arch);
            let outcome = manager.generate_for_library(&library, offset, only_save)?;
            println!("library:  {}", library.display());
            println!("build id: {}", outcome.build_id);
            match outcome.stats {
                Some(stats) => {
                    println!("fdes:     {} ({} shadowed, {} broken)", stats.fdes, stats.shadowed_fdes, stats.broken_fdes);
                    println!(
                        "rows:     {} ({} unsupported, {} unencodable)",
                        stats.rows, stats.unsupported_rows, stats.unencodable_rows
                    );
                    if stats.exidx_entries > 0 {
                        println!("exidx:    {} ({} broken)", stats.exidx_entries, stats.broken_exidx_entries);
                    }
                    println!("entries:  {} ({} table rows)", stats.entries, stats.table_rows);
                }
                None => println!("table already cached"),
            }
            Ok(())
        }
        Commands::Inspect { file } => inspect(&file),
        Commands::Maps { pid } => print_maps(pid),
        Commands::Backtrace { mode } => backtrace(config(cli.cache_dir)?, mode),
        Commands::WarmUp { .. } => Err("warm-up requires the async runtime".into()),
    }
}

async fn run_command_async(cli: Cli) -> CliResult<()>
{
    let Commands::WarmUp { libraries, pid } = cli.command else {
        return Err("only warm-up runs on the async runtime".into());
    };
    let config = config(cli.cache_dir)?;
    let libraries = if libraries.is_empty() {
        loaded_libraries(pid)?
    } else {
        libraries.into_iter().map(|path| (path, 0)).collect()
    };
    info!("Warming up {} libraries", libraries.len());

    let manager = Arc::new(QutTableManager::new(&config.cache_dir, config.arch));
    let tasks: Vec<_> = libraries
        .into_iter()
        .map(|(path, offset)| {
            let manager = Arc::clone(&manager);
            tokio::task::spawn_blocking(move || {
                let result = manager.generate_for_library(&path, offset, true);
                (path, result)
            })
        })
        .collect();

    let (mut generated, mut cached, mut failed) = (0usize, 0usize, 0usize);
    for task in tasks {
        let (path, result) = task.await?;
        match result {
            Ok(outcome) if outcome.generated() => generated += 1,
            Ok(_) => cached += 1,
            Err(err) => {
                warn!("{}: {}", path.display(), err);
                failed += 1;
            }
        }
    }
    manager.mark_warmed_up();
    println!("generated {generated}, already cached {cached}, failed {failed}");
    Ok(())
}

/// Executable, file-backed mappings as `(path, elf_start_offset)`.
fn loaded_libraries(pid: Option<u32>) -> CliResult<Vec<(PathBuf, u64)>>
{
    let maps = maps_for(pid);
    let snapshot = maps.parse()?;
    let mut libraries: Vec<(PathBuf, u64)> = snapshot
        .iter()
        .filter(|segment| segment.flags.contains(MapFlags::EXEC) && segment.name.starts_with('/'))
        .filter_map(|segment| {
            snapshot
                .elf_location(segment, quicken_core::elf::has_elf_header_at)
                .map(|location| (location.path, location.elf_start_offset))
        })
        .collect();
    libraries.sort();
    libraries.dedup();
    Ok(libraries)
}

fn maps_for(pid: Option<u32>) -> Maps
{
    match pid {
        Some(pid) => Maps::new(Box::new(ProcMaps::for_pid(pid))),
        None => Maps::for_current_process(),
    }
}

fn inspect(file: &Path) -> CliResult<()>
{
    let bytes = std::fs::read(file)?;
    let mut last_err = None;
    for arch in [Arch::Arm64, Arch::Arm] {
        match QutSections::from_bytes(&bytes, arch) {
            Ok(sections) => {
                print_sections(file, &sections);
                return Ok(());
            }
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) => Err(err.into()),
        None => Err("no architecture to try".into()),
    }
}

fn print_sections(file: &Path, sections: &QutSections)
{
    let width = sections.arch().word_size() * 2;
    println!("file:     {}", file.display());
    println!("arch:     {}", sections.arch());
    println!("entries:  {}", sections.entry_count());
    println!("rows:     {}", sections.tbl().len());
    println!("checksum: {:0width$x}", sections.checksum());
    for pair in sections.idx().chunks_exact(2).take(16) {
        println!("  {:0width$x} -> {:0width$x}", pair[0], pair[1]);
    }
    if sections.entry_count() > 16 {
        println!("  ... {} more", sections.entry_count() - 16);
    }
}

fn print_maps(pid: Option<u32>) -> CliResult<()>
{
    let snapshot = maps_for(pid).parse()?;
    for segment in snapshot.iter() {
        let mut tags = Vec::new();
        if segment.flags.contains(MapFlags::DEVICE) {
            tags.push("device");
        }
        if segment.is_jit() {
            tags.push("jit");
        }
        if segment.maybe_java() {
            tags.push("java");
        }
        println!(
            "{:012x}-{:012x} {}{}{} {:08x} {} {}",
            segment.start,
            segment.end,
            if segment.is_readable() { 'r' } else { '-' },
            if segment.flags.contains(MapFlags::WRITE) { 'w' } else { '-' },
            if segment.flags.contains(MapFlags::EXEC) { 'x' } else { '-' },
            segment.offset,
            segment.name,
            if tags.is_empty() { String::new() } else { format!("[{}]", tags.join(",")) },
        );
    }
    Ok(())
}

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "aarch64", target_arch = "x86_64")
))]
fn backtrace(config: QuickenConfig, mode: UnwindMode) -> CliResult<()>
{
    use quicken_core::{Frame, Unwinder};

    let max_frames = config.max_frames;
    let unwinder = Arc::new(Unwinder::new(config)?);
    unwinder.set_mode(mode);
    unwinder.set_quicken_always_enabled(true);
    let manager = Arc::clone(unwinder.manager());
    unwinder.set_generate_delegate(Arc::new(move |path: &Path, offset: u64| {
        manager.generate_for_library(path, offset, false).is_ok()
    }));

    let mut frames = vec![Frame::default(); max_frames];
    let report = unwinder.unwind_current_thread(&mut frames);
    info!(mode = %mode, frames = report.frame_count, "unwind finished");
    for detail in unwinder.restore_frame_detail(&frames[..report.frame_count]) {
        println!("{detail}");
    }
    if let Some(err) = report.error {
        println!("stopped: {err}");
    }
    Ok(())
}

#[cfg(not(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "aarch64", target_arch = "x86_64")
)))]
fn backtrace(_config: QuickenConfig, _mode: UnwindMode) -> CliResult<()>
{
    Err("backtrace is only available on Linux/Android for aarch64 and x86_64".into())
}
