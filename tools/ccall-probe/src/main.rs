///
/// ccall-probe - Inspect native interop on the running host
///
/// Commands:
/// - ccall-probe symbol <NAME> [--library LIB]: resolve a symbol through a call-site cell
/// - ccall-probe library <LIB>: resolve a library handle
/// - ccall-probe slots [--count N]: lease trampoline slots and show page statistics
/// - ccall-probe filename <PATTERN>: expand an output filename template
///

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use ccall_runtime::{
    format_filename, InteropConfig, InteropError, LibraryName, LibraryRegistry, LibrarySource, SlotPool, SymbolCell,
    SystemLoader,
};
use tracing::Level;

#[derive(Parser)]
#[command(name = "ccall-probe")]
#[command(author, version, about = "Probe native library resolution and trampolines", long_about = None)]
struct Cli {
    /// Interop configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a symbol twice through one call-site cell
    Symbol {
        /// Symbol name
        name: String,

        /// Library to search (default symbol scope when omitted)
        #[arg(long)]
        library: Option<String>,
    },

    /// Resolve a library handle
    Library {
        /// Library name or path
        name: String,
    },

    /// Lease trampoline slots and print page statistics
    Slots {
        /// Number of slots to lease
        #[arg(long, default_value_t = 4)]
        count: usize,
    },

    /// Expand an output filename template
    Filename {
        /// Pattern with %p, %d, %i, %L, %l, %u tokens
        pattern: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_max_level(level)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), InteropError> {
    let config = match &cli.config {
        Some(path) => InteropConfig::from_path(path)?,
        None => InteropConfig::default(),
    };

    match cli.command {
        Commands::Symbol { name, library } => probe_symbol(&config, &name, library.as_deref()),
        Commands::Library { name } => probe_library(&config, &name),
        Commands::Slots { count } => probe_slots(&config, count),
        Commands::Filename { pattern } => {
            println!("{}", format_filename(&pattern));
            Ok(())
        }
    }
}

fn registry(config: &InteropConfig) -> Result<LibraryRegistry, InteropError> {
    let loader = SystemLoader::new(config.loader.search_paths.clone());
    let sentinels = loader.sentinels()?;
    Ok(LibraryRegistry::new(Arc::new(loader), sentinels, config.load_flags()))
}

fn probe_symbol(config: &InteropConfig, name: &str, library: Option<&str>) -> Result<(), InteropError> {
    let registry = registry(config)?;
    let source = LibrarySource::Name(LibraryName::from(library));
    let cell = SymbolCell::new();

    let first = registry.resolve_and_cache(source, name, &cell)?;
    let cached = cell.get().is_some();
    let second = registry.resolve_and_cache(source, name, &cell)?;

    println!("symbol:  {}", name);
    println!("library: {}", LibraryName::from(library));
    println!("address: {:p}", first.as_ptr());
    println!("cached:  {}", cached && first == second);
    Ok(())
}

fn probe_library(config: &InteropConfig, name: &str) -> Result<(), InteropError> {
    let registry = registry(config)?;
    let handle = registry.require(LibraryName::Named(name))?;

    println!("library: {}", name);
    println!("handle:  {:p}", handle.as_raw());
    Ok(())
}

fn probe_slots(config: &InteropConfig, count: usize) -> Result<(), InteropError> {
    let mut pool = SlotPool::new(config.trampolines.slot_size)?;

    for i in 0..count {
        let slot = pool.allocate()?;
        println!("slot {:>4}: {:p}", i, slot.as_ptr());
    }

    let stats = pool.stats();
    println!("slot size:    {}", stats.slot_size);
    println!("page size:    {}", stats.page_size);
    println!("pages mapped: {}", stats.pages_mapped);
    println!("free slots:   {}", stats.free_slots);
    Ok(())
}
