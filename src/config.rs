use crate::patcher_aslr::BackupPolicy;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_FILE_NAME: &str = "nodynbase.toml";
const CONFIG_ENV_VAR: &str = "NODYNBASE_CONFIG";

fn default_make_backup() -> bool {
	true
}

fn default_backup_extension() -> String {
	"bak".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
	#[serde(default = "default_make_backup")]
	pub make_backup: bool,
	#[serde(default = "default_backup_extension")]
	pub backup_extension: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub log_file: Option<PathBuf>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			make_backup: default_make_backup(),
			backup_extension: default_backup_extension(),
			log_file: None,
		}
	}
}

/// `NODYNBASE_CONFIG` if set, otherwise `nodynbase.toml` beside the executable.
pub fn config_path() -> Option<PathBuf> {
	if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
		return Some(PathBuf::from(path));
	}
	let exe = std::env::current_exe().ok()?;
	Some(exe.parent()?.join(CONFIG_FILE_NAME))
}

pub fn validate_backup_extension(extension: &str) -> Result<()> {
	if extension.is_empty() {
		return Err(anyhow!("Backup extension must not be empty"));
	}
	if extension.starts_with('.') {
		return Err(anyhow!(
			"Backup extension {:?} must not start with a dot",
			extension
		));
	}
	if extension.contains(['/', '\\']) {
		return Err(anyhow!(
			"Backup extension {:?} must not contain path separators",
			extension
		));
	}
	Ok(())
}

impl Config {
	pub fn load_from(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path)
			.with_context(|| format!("Couldn't read config file {:?}", path))?;
		let config: Config =
			toml::from_str(&text).with_context(|| format!("Couldn't parse config file {:?}", path))?;
		validate_backup_extension(&config.backup_extension)?;
		Ok(config)
	}

	/// Defaults when `path` doesn't exist; an unreadable or invalid file is an error.
	pub fn load_at(path: &Path) -> Result<Self> {
		if !path.exists() {
			return Ok(Config::default());
		}
		Config::load_from(path)
	}

	pub fn load() -> Result<Self> {
		let path = config_path().context("Couldn't determine config path")?;
		Config::load_at(&path)
	}

	/// Applies backup settings to the file at `path`, keeping every other
	/// setting. Nothing is written if the existing file doesn't load.
	pub fn update_backup_at(
		path: &Path,
		extension: Option<&str>,
		enabled: Option<bool>,
	) -> Result<Self> {
		let mut config = Config::load_at(path)
			.with_context(|| format!("Refusing to overwrite config file {:?}", path))?;
		if let Some(extension) = extension {
			config.set_backup_extension(extension)?;
		}
		if let Some(enabled) = enabled {
			config.make_backup = enabled;
		}
		config.save_to(path)?;
		debug!("Saved config to {:?}", path);
		Ok(config)
	}

	pub fn save_to(&self, path: &Path) -> Result<()> {
		let text = toml::to_string_pretty(self).context("Couldn't serialize config")?;
		std::fs::write(path, text)
			.with_context(|| format!("Couldn't write config file {:?}", path))?;
		Ok(())
	}

	pub fn set_backup_extension(&mut self, extension: &str) -> Result<()> {
		validate_backup_extension(extension)?;
		self.backup_extension = extension.to_string();
		Ok(())
	}

	pub fn backup_policy(&self) -> BackupPolicy {
		BackupPolicy {
			enabled: self.make_backup,
			extension: self.backup_extension.clone(),
		}
	}
}
