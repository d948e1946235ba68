#![cfg_attr(feature = "bundle", windows_subsystem = "windows")]

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod config;
mod gui;
mod logging;
mod patcher;
mod pe;

use config::{Config, LoadedConfig};
use patcher::{inspect, process_file, restore_backup};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// FixDynamicBase
///
/// Clears the DYNAMIC_BASE (ASLR) flag of a PE executable so it always loads
/// at its preferred base address. Run without a command to open the
/// drag-and-drop window.
#[derive(Parser)]
#[command(name = "FixDynamicBase")]
#[command(version = VERSION)]
#[command(about = "Clear IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE in PE executables")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Clear DYNAMIC_BASE in FILE, keeping a backup next to it
	Patch {
		/// Path to the .exe or .dll
		file: PathBuf,
	},

	/// Show the header layout and DYNAMIC_BASE state without changing anything
	Check {
		/// Path to the .exe or .dll
		file: PathBuf,
	},

	/// Put the backup copy back over FILE
	Restore {
		/// Path to the patched .exe or .dll (not the backup)
		file: PathBuf,
	},

	/// Show current configuration
	Config {
		/// Write a config file with the current values next to the executable
		#[arg(long)]
		init: bool,

		/// With --init, replace a config file that failed to parse
		#[arg(long, requires = "init")]
		force: bool,
	},
}

fn cmd_patch(file: &Path, config: &Config) -> Result<()> {
	println!("Clearing DYNAMIC_BASE in: {:?}", file);

	let outcome = process_file(file, config);
	if outcome.is_failure() {
		return Err(match outcome.detail() {
			Some(detail) => anyhow!("{}\n  {}", outcome, detail),
			None => anyhow!("{}", outcome),
		});
	}
	println!("  {}", outcome);

	Ok(())
}

fn cmd_check(file: &Path) -> Result<()> {
	println!("Checking DYNAMIC_BASE status of: {:?}", file);

	let info = inspect(file)?;
	println!("  Format: {}", info.kind);
	println!("  Machine: {:#06x}", info.machine);
	println!("  PE header offset: {:#x}", info.nt_headers_offset);
	println!("  DllCharacteristics offset: {:#x}", info.field_offset);
	println!("  DllCharacteristics: {:#06x}", info.dll_characteristics);
	println!("  SHA-256: {}", info.sha256);
	if info.is_dynamic_base() {
		println!("  Status: NOT PATCHED (DYNAMIC_BASE is set)");
	} else {
		println!("  Status: PATCHED (DYNAMIC_BASE is clear)");
	}

	Ok(())
}

fn cmd_restore(file: &Path, config: &Config) -> Result<()> {
	let backup = config.backup_path(file);
	println!("Restoring {:?} from {:?}", file, backup);

	restore_backup(file, &backup).context("Restore failed")?;
	println!("  Restored original file");

	Ok(())
}

fn cmd_config(loaded: &LoadedConfig, init: bool, force: bool) -> Result<()> {
	let config = &loaded.config;
	let path = Config::path();

	if init {
		let path = path
			.as_deref()
			.context("Couldn't locate executable directory")?;
		loaded.write_to(path, force)?;
		println!("Wrote configuration to: {:?}", path);
	}

	println!("Current configuration:");
	match path {
		Some(path) if loaded.rejected => println!("  File: {:?} (rejected, using defaults)", path),
		Some(path) if path.exists() => println!("  File: {:?}", path),
		Some(path) => println!("  File: {:?} (not created, using defaults)", path),
		None => println!("  File: unavailable"),
	}
	for warning in &loaded.warnings {
		println!("  Warning: {}", warning);
	}
	println!("  Backup extension: .{}", config.backup_extension);
	println!("  Warn on backup failure: {}", config.warn_on_backup_failure);
	println!("  Log to file: {}", config.log_to_file);
	println!("  Log level: {}", config.log_level);

	Ok(())
}

fn main() {
	let cli = Cli::parse();
	let loaded = Config::load();
	let log_guard = logging::init(&loaded.config);
	for warning in &loaded.warnings {
		tracing::warn!("{}", warning);
	}

	let result = match cli.command {
		None => {
			gui::launch(loaded.config);
			Ok(())
		}
		Some(Commands::Patch { file }) => cmd_patch(&file, &loaded.config),
		Some(Commands::Check { file }) => cmd_check(&file),
		Some(Commands::Restore { file }) => cmd_restore(&file, &loaded.config),
		Some(Commands::Config { init, force }) => cmd_config(&loaded, init, force),
	};

	if let Err(e) = result {
		drop(log_guard);
		eprintln!("Error: {:#}", e);
		std::process::exit(1);
	}
}
