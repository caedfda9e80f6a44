use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod patcher_aslr;
mod pe;

use config::Config;
use patcher_aslr::patch_file;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// NoDynamicBase
///
/// Clears the DYNAMIC_BASE flag in a PE executable's DllCharacteristics so the
/// loader keeps it at its preferred image base. Only that one field is written.
#[derive(Parser)]
#[command(name = "NoDynamicBase")]
#[command(version = VERSION)]
#[command(about = "Clear IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE in a PE file")]
struct Cli {
	/// Print debug diagnostics
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Clear DYNAMIC_BASE in an executable or DLL
	Patch {
		/// Path to the PE file
		path: PathBuf,

		/// Don't copy the original file before writing
		#[arg(long)]
		no_backup: bool,

		/// Extension appended to the backup copy (overrides config)
		#[arg(long)]
		backup_extension: Option<String>,
	},

	/// Show the header layout and DllCharacteristics without making changes
	Check {
		/// Path to the PE file
		path: PathBuf,
	},

	/// Change the persisted backup settings
	SetBackup {
		/// Extension appended to the backup copy
		#[arg(long)]
		extension: Option<String>,

		/// Whether to make a backup before patching
		#[arg(long)]
		enabled: Option<bool>,
	},

	/// Show current configuration
	Config,
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
	let default_level = if verbose { "debug" } else { "warn" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
	let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

	match log_file {
		Some(path) => {
			let file = std::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(path)
				.with_context(|| format!("Couldn't open log file {:?}", path))?;
			let (writer, guard) = tracing_appender::non_blocking(file);
			tracing_subscriber::registry()
				.with(filter)
				.with(stderr_layer)
				.with(fmt::layer().with_writer(writer).with_ansi(false))
				.init();
			Ok(Some(guard))
		}
		None => {
			tracing_subscriber::registry()
				.with(filter)
				.with(stderr_layer)
				.init();
			Ok(None)
		}
	}
}

fn cmd_patch(
	config: &Config,
	path: PathBuf,
	no_backup: bool,
	backup_extension: Option<String>,
) -> Result<()> {
	if !path.is_file() {
		return Err(anyhow!("Invalid path: {:?}\nExpected a PE file", path));
	}

	let mut policy = config.backup_policy();
	if no_backup {
		policy.enabled = false;
	}
	if let Some(extension) = backup_extension {
		config::validate_backup_extension(&extension)?;
		policy.extension = extension;
	}

	println!("Clearing DYNAMIC_BASE in: {:?}", path);
	let outcome = patch_file(&path, &policy)?;
	println!("  {}", outcome);

	Ok(())
}

fn cmd_check(path: PathBuf) -> Result<()> {
	println!("Checking DllCharacteristics of: {:?}", path);

	let info = patcher_aslr::inspect_file(&path)?;

	println!(
		"  Layout: {} ({} byte optional header)",
		info.kind,
		info.kind.optional_header_size()
	);
	println!("  NT headers: 0x{:X}", info.nt_offset);
	println!("  ImageBase: 0x{:X}", info.image_base);
	println!(
		"  DllCharacteristics: 0x{:04X} at 0x{:X} [{}]",
		info.dll_characteristics,
		info.dll_characteristics_offset,
		pe::describe_dll_characteristics(info.dll_characteristics).join(" | ")
	);
	if info.is_dynamic_base() {
		println!("  Status: DYNAMIC_BASE set (can be patched)");
	} else {
		println!("  Status: DYNAMIC_BASE clear (no change needed)");
	}

	Ok(())
}

fn cmd_set_backup(extension: Option<String>, enabled: Option<bool>) -> Result<()> {
	if extension.is_none() && enabled.is_none() {
		return Err(anyhow!("Nothing to change. Pass --extension and/or --enabled"));
	}

	let path = config::config_path().context("Couldn't determine config path")?;
	Config::update_backup_at(&path, extension.as_deref(), enabled)?;
	println!("Configuration saved to: {:?}", path);

	Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
	println!("Current configuration:");
	match config::config_path() {
		Some(path) if path.exists() => println!("  File: {:?}", path),
		Some(path) => println!("  File: {:?} (not created, using defaults)", path),
		None => println!("  File: unknown (using defaults)"),
	}
	println!("  Make backup: {}", config.make_backup);
	println!("  Backup extension: .{}", config.backup_extension);
	match &config.log_file {
		Some(log_file) => println!("  Log file: {:?}", log_file),
		None => println!("  Log file: none"),
	}

	Ok(())
}

fn main() {
	let cli = Cli::parse();
	// The subscriber isn't installed yet, since the log file comes from the config
	let config = Config::load().unwrap_or_else(|e| {
		eprintln!("Warning: {:#}\n  Using default configuration", e);
		Config::default()
	});

	let _guard = match init_logging(cli.verbose, config.log_file.as_deref()) {
		Ok(guard) => guard,
		Err(e) => {
			eprintln!("Error: {:#}", e);
			std::process::exit(1);
		}
	};

	let result = match cli.command {
		Commands::Patch {
			path,
			no_backup,
			backup_extension,
		} => cmd_patch(&config, path, no_backup, backup_extension),
		Commands::Check { path } => cmd_check(path),
		Commands::SetBackup { extension, enabled } => cmd_set_backup(extension, enabled),
		Commands::Config => cmd_config(&config),
	};

	if let Err(e) = result {
		eprintln!("Error: {:#}", e);
		std::process::exit(1);
	}
}
