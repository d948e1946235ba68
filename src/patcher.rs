use crate::config::Config;
use crate::pe::{self, OptionalHeaderKind, ValidationError, IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE};
use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Clears `flag` in a little-endian u16 field. Returns whether the field changed.
pub fn clear_flag(field: &mut [u8; 2], flag: u16) -> bool {
	let old = LittleEndian::read_u16(field);
	if old & flag == 0 {
		return false;
	}
	LittleEndian::write_u16(field, old & !flag);
	true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchReport {
	pub kind: OptionalHeaderKind,
	pub before: u16,
	pub after: u16,
}

impl PatchReport {
	pub fn changed(&self) -> bool {
		self.before != self.after
	}
}

/// Clears DYNAMIC_BASE in an in-memory image. Only the two bytes of
/// `DllCharacteristics` can change.
pub fn clear_dynamic_base(image: &mut [u8]) -> Result<PatchReport, ValidationError> {
	let location = pe::locate(image)?;
	// locate() already bounds-checked the whole NT header span
	let field = location
		.field_mut(image)
		.ok_or(ValidationError::InvalidHeaderOffset)?;
	let before = LittleEndian::read_u16(field);
	clear_flag(field, IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE);
	let after = LittleEndian::read_u16(field);
	Ok(PatchReport {
		kind: location.kind,
		before,
		after,
	})
}

pub fn load_image(path: &Path) -> Result<Vec<u8>> {
	let mut file =
		File::open(path).with_context(|| format!("Couldn't open {:?}", path))?;
	let mut buffer = Vec::new();
	file.read_to_end(&mut buffer)
		.with_context(|| format!("Couldn't read {:?}", path))?;
	if buffer.is_empty() {
		return Err(anyhow!("File {:?} is empty", path));
	}
	Ok(buffer)
}

pub fn make_backup(path: &Path, backup_path: &Path) -> Result<()> {
	std::fs::copy(path, backup_path).with_context(|| {
		format!("Failed to create backup of file {:?} at {:?}", path, backup_path)
	})?;
	Ok(())
}

/// Overwrites the file contents in place. The file is opened without
/// truncation and the buffer must be the same length as the original.
pub fn write_image(path: &Path, image: &[u8]) -> Result<()> {
	let metadata =
		std::fs::metadata(path).with_context(|| format!("Couldn't stat {:?}", path))?;
	if metadata.permissions().readonly() {
		return Err(anyhow!("Couldn't write {:?}: File is readonly", path));
	}
	let mut file = File::options()
		.read(true)
		.write(true)
		.open(path)
		.with_context(|| format!("Couldn't open {:?} for writing", path))?;
	file.seek(SeekFrom::Start(0))?;
	file.write_all(image)
		.with_context(|| format!("Couldn't write {:?}", path))?;
	file.flush()?;
	file.sync_all()
		.with_context(|| format!("Couldn't flush {:?} to disk", path))?;
	Ok(())
}

pub fn restore_backup(path: &Path, backup_path: &Path) -> Result<()> {
	if !backup_path.is_file() {
		return Err(anyhow!("No backup found at {:?}", backup_path));
	}
	std::fs::copy(backup_path, path)
		.with_context(|| format!("Failed to restore {:?} from {:?}", path, backup_path))?;
	info!(path = %path.display(), backup = %backup_path.display(), "restored backup");
	Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	const_hex::encode(hasher.finalize())
}

/// What happened to one dropped file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
	ReadFailed { path: PathBuf, error: String },
	Invalid(ValidationError),
	NoChangeNeeded,
	Patched {
		backup: PathBuf,
		backup_warning: Option<String>,
	},
	WriteFailed { error: String },
}

impl Outcome {
	/// Underlying I/O error text, for the command line.
	pub fn detail(&self) -> Option<&str> {
		match self {
			Outcome::ReadFailed { error, .. } | Outcome::WriteFailed { error } => Some(error),
			_ => None,
		}
	}

	pub fn is_failure(&self) -> bool {
		matches!(
			self,
			Outcome::ReadFailed { .. } | Outcome::Invalid(_) | Outcome::WriteFailed { .. }
		)
	}
}

impl std::fmt::Display for Outcome {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Outcome::ReadFailed { path, .. } => {
				write!(f, "Failed to read file:\n{}", path.display())
			}
			Outcome::Invalid(reason) => write!(f, "Error: {}", reason),
			Outcome::NoChangeNeeded => write!(f, "No change needed (already fixed)"),
			Outcome::Patched {
				backup,
				backup_warning,
			} => {
				write!(
					f,
					"Success! DYNAMIC_BASE cleared. Backup: {}",
					backup.display()
				)?;
				if let Some(warning) = backup_warning {
					write!(f, "\nWarning: {}", warning)?;
				}
				Ok(())
			}
			Outcome::WriteFailed { .. } => write!(f, "Write failed (permission or file in use)"),
		}
	}
}

/// Load, validate, patch, back up and write one file.
pub fn process_file(path: &Path, config: &Config) -> Outcome {
	info!(path = %path.display(), "processing file");

	let mut image = match load_image(path) {
		Ok(image) => image,
		Err(e) => {
			warn!("{:#}", e);
			return Outcome::ReadFailed {
				path: path.to_path_buf(),
				error: format!("{:#}", e),
			};
		}
	};
	debug!(size = image.len(), sha256 = %sha256_hex(&image), "loaded image");

	let report = match clear_dynamic_base(&mut image) {
		Ok(report) => report,
		Err(reason) => {
			if let ValidationError::UnknownFormat(magic) = reason {
				debug!("optional header magic {:#06x}", magic);
			}
			warn!(%reason, "rejected {:?}", path);
			return Outcome::Invalid(reason);
		}
	};

	if !report.changed() {
		info!(kind = %report.kind, dll_characteristics = report.before, "DYNAMIC_BASE already clear");
		return Outcome::NoChangeNeeded;
	}

	let backup = config.backup_path(path);
	let backup_warning = match make_backup(path, &backup) {
		Ok(()) => {
			debug!(backup = %backup.display(), "backup written");
			None
		}
		Err(e) => {
			warn!("{:#}", e);
			config
				.warn_on_backup_failure
				.then(|| format!("backup failed ({:#})", e))
		}
	};

	if let Err(e) = write_image(path, &image) {
		error!("{:#}", e);
		return Outcome::WriteFailed {
			error: format!("{:#}", e),
		};
	}

	info!(
		kind = %report.kind,
		before = %format!("{:#06x}", report.before),
		after = %format!("{:#06x}", report.after),
		"DYNAMIC_BASE cleared"
	);
	Outcome::Patched {
		backup,
		backup_warning,
	}
}

/// Read-only summary of an image, used by `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
	pub kind: OptionalHeaderKind,
	pub machine: u16,
	pub nt_headers_offset: usize,
	pub field_offset: usize,
	pub dll_characteristics: u16,
	pub sha256: String,
}

impl ImageInfo {
	pub fn is_dynamic_base(&self) -> bool {
		self.dll_characteristics & IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE != 0
	}
}

pub fn inspect(path: &Path) -> Result<ImageInfo> {
	let image = load_image(path)?;
	let location = pe::locate(&image).map_err(|reason| anyhow!("{:?}: {}", path, reason))?;
	let dll_characteristics = location
		.read(&image)
		.context("DllCharacteristics out of bounds")?;
	Ok(ImageInfo {
		kind: location.kind,
		machine: location.machine,
		nt_headers_offset: location.nt_headers_offset,
		field_offset: location.offset(),
		dll_characteristics,
		sha256: sha256_hex(&image),
	})
}
