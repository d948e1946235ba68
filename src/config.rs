use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "fix-dynamic-base.toml";
pub const DEFAULT_BACKUP_EXTENSION: &str = "bak";

/// Directory the executable lives in; config and logs are kept beside it.
pub static APP_DIR: Lazy<Option<PathBuf>> = Lazy::new(|| {
	std::env::current_exe()
		.ok()
		.and_then(|exe| exe.parent().map(Path::to_path_buf))
});

/// Result of reading the config file. Logging is not set up yet when this is
/// loaded, so warnings are kept for the caller to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConfig {
	pub config: Config,
	pub warnings: Vec<String>,
	/// The file exists but could not be used at all
	pub rejected: bool,
}

impl LoadedConfig {
	fn defaults() -> Self {
		Self {
			config: Config::default(),
			warnings: Vec::new(),
			rejected: false,
		}
	}

	/// Writes the active values to `path`. A rejected file is only replaced
	/// with `force`.
	pub fn write_to(&self, path: &Path, force: bool) -> Result<()> {
		if self.rejected && !force {
			return Err(anyhow!(
				"Config {:?} could not be parsed and was not overwritten (use --force to replace it with defaults)",
				path
			));
		}
		self.config.save_to(path)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Appended to the original path (`game.exe` -> `game.exe.bak`)
	pub backup_extension: String,
	/// Show backup failures in the report instead of only logging them
	pub warn_on_backup_failure: bool,
	pub log_to_file: bool,
	/// Used when `RUST_LOG` is not set
	pub log_level: String,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			backup_extension: DEFAULT_BACKUP_EXTENSION.to_string(),
			warn_on_backup_failure: false,
			log_to_file: true,
			log_level: "info".to_string(),
		}
	}
}

impl Config {
	pub fn path() -> Option<PathBuf> {
		APP_DIR.as_ref().map(|dir| dir.join(CONFIG_FILE_NAME))
	}

	pub fn load() -> LoadedConfig {
		match Self::path() {
			Some(path) => Self::load_or_default_from(&path),
			None => LoadedConfig::defaults(),
		}
	}

	/// Never fails: a missing file gives defaults, a broken one gives defaults
	/// plus the reason it was rejected.
	pub fn load_or_default_from(path: &Path) -> LoadedConfig {
		if !path.exists() {
			return LoadedConfig::defaults();
		}
		match Self::load_from(path) {
			Ok((config, warnings)) => LoadedConfig {
				config,
				warnings,
				rejected: false,
			},
			Err(e) => LoadedConfig {
				config: Self::default(),
				warnings: vec![format!("{:#}, using defaults", e)],
				rejected: true,
			},
		}
	}

	pub fn load_from(path: &Path) -> Result<(Self, Vec<String>)> {
		let text = std::fs::read_to_string(path)
			.with_context(|| format!("Couldn't read config {:?}", path))?;
		Self::parse(&text).with_context(|| format!("Couldn't parse config {:?}", path))
	}

	/// Parses a config file, replacing invalid values with their defaults.
	/// Each replacement is reported in the returned warnings.
	pub fn parse(text: &str) -> Result<(Self, Vec<String>)> {
		let mut config: Self = toml::from_str(text)?;
		let mut warnings = Vec::new();
		if !is_valid_extension(&config.backup_extension) {
			warnings.push(format!(
				"Invalid backup_extension {:?}, using {:?}",
				config.backup_extension, DEFAULT_BACKUP_EXTENSION
			));
			config.backup_extension = DEFAULT_BACKUP_EXTENSION.to_string();
		}
		Ok((config, warnings))
	}

	pub fn save_to(&self, path: &Path) -> Result<()> {
		let text = toml::to_string_pretty(self)?;
		std::fs::write(path, text).with_context(|| format!("Couldn't write config {:?}", path))
	}

	/// `<original path>.<backup_extension>`, keeping non-UTF-8 paths intact.
	pub fn backup_path(&self, original: &Path) -> PathBuf {
		let mut name = OsString::from(original.as_os_str());
		name.push(".");
		name.push(&self.backup_extension);
		PathBuf::from(name)
	}

	pub fn log_dir() -> Option<PathBuf> {
		APP_DIR.as_ref().map(|dir| dir.join("logs"))
	}
}

fn is_valid_extension(extension: &str) -> bool {
	!extension.is_empty() && !extension.contains(['/', '\\', '\0'])
}
