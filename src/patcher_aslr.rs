use crate::pe::{
	classify_optional_header, dll_characteristics_offset, inspect, locate_nt_header, PatchError,
	PeHeaderInfo, IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE,
};
use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
	Modified { old: u16, new: u16 },
	Unmodified { value: u16 },
}

impl PatchOutcome {
	pub fn was_modified(&self) -> bool {
		matches!(self, PatchOutcome::Modified { .. })
	}

	/// DllCharacteristics before and after, equal when nothing was written.
	pub fn values(&self) -> (u16, u16) {
		match *self {
			PatchOutcome::Modified { old, new } => (old, new),
			PatchOutcome::Unmodified { value } => (value, value),
		}
	}
}

/// Clears IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE in place. Only the two bytes of
/// DllCharacteristics are ever written, and only when the flag is set.
pub fn clear_dynamic_base(data: &mut [u8]) -> Result<PatchOutcome, PatchError> {
	let nt_offset = locate_nt_header(data)?;
	let kind = classify_optional_header(data, nt_offset)?;
	let field = dll_characteristics_offset(nt_offset);
	debug!("{} image, DllCharacteristics at 0x{:x}", kind, field);

	let bytes = &mut data[field..field + 2];
	let old = LittleEndian::read_u16(bytes);
	if old & IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE == 0 {
		return Ok(PatchOutcome::Unmodified { value: old });
	}

	let new = old & !IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE;
	LittleEndian::write_u16(bytes, new);
	Ok(PatchOutcome::Modified { old, new })
}

#[derive(Debug, Error)]
pub enum FileError {
	#[error("Failed to read file {path:?}")]
	ReadFailed {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("Write failed (permission or file in use): {path:?}")]
	WriteFailed {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("Failed to create backup {backup:?}")]
	BackupFailed {
		backup: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("Backup {backup:?} does not match the original (sha256 {expected}, got {actual})")]
	BackupMismatch {
		backup: PathBuf,
		expected: String,
		actual: String,
	},
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPolicy {
	pub enabled: bool,
	pub extension: String,
}

impl Default for BackupPolicy {
	fn default() -> Self {
		BackupPolicy {
			enabled: true,
			extension: "bak".to_string(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
	Patched {
		backup: Option<PathBuf>,
		old: u16,
		new: u16,
	},
	AlreadyCleared,
}

impl std::fmt::Display for FileOutcome {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			FileOutcome::Patched {
				backup: Some(backup),
				old,
				new,
			} => write!(
				f,
				"Success! DYNAMIC_BASE cleared (0x{:04X} -> 0x{:04X}). Backup: {}",
				old,
				new,
				backup.display()
			),
			FileOutcome::Patched {
				backup: None,
				old,
				new,
			} => write!(
				f,
				"Success! DYNAMIC_BASE cleared (0x{:04X} -> 0x{:04X}). No backup made",
				old, new
			),
			FileOutcome::AlreadyCleared => write!(f, "No change needed (already fixed)"),
		}
	}
}

fn read_file(path: &Path) -> Result<Vec<u8>, FileError> {
	std::fs::read(path).map_err(|source| FileError::ReadFailed {
		path: path.to_path_buf(),
		source,
	})
}

fn sha_hash_path(path: &Path) -> std::io::Result<Vec<u8>> {
	let mut file = File::open(path)?;
	let mut hasher = Sha256::new();
	std::io::copy(&mut file, &mut hasher)?;
	Ok(hasher.finalize().to_vec())
}

fn backup_path(path: &Path, backup_extension: &str) -> PathBuf {
	let mut name = path.as_os_str().to_os_string();
	name.push(".");
	name.push(backup_extension);
	PathBuf::from(name)
}

/// Copies the original next to itself and checks the copy against the bytes we
/// read, so a file swapped underneath us is never overwritten.
fn make_backup(path: &Path, original: &[u8], backup_extension: &str) -> Result<PathBuf, FileError> {
	let backup = backup_path(path, backup_extension);
	std::fs::copy(path, &backup).map_err(|source| FileError::BackupFailed {
		backup: backup.clone(),
		source,
	})?;

	let expected = Sha256::digest(original).to_vec();
	let actual = sha_hash_path(&backup).map_err(|source| FileError::BackupFailed {
		backup: backup.clone(),
		source,
	})?;
	if actual != expected {
		return Err(FileError::BackupMismatch {
			backup,
			expected: const_hex::encode(expected),
			actual: const_hex::encode(actual),
		});
	}

	info!("Backup written to {:?}", backup);
	Ok(backup)
}

fn ensure_writable(path: &Path) -> Result<(), FileError> {
	let write_failed = |source| FileError::WriteFailed {
		path: path.to_path_buf(),
		source,
	};
	if std::fs::metadata(path).map_err(write_failed)?.permissions().readonly() {
		return Err(write_failed(std::io::Error::new(
			std::io::ErrorKind::PermissionDenied,
			"file is readonly",
		)));
	}
	Ok(())
}

pub fn inspect_file(path: &Path) -> Result<PeHeaderInfo> {
	let data = read_file(path)?;
	let info = inspect(&data).with_context(|| format!("Couldn't parse PE headers of {:?}", path))?;
	Ok(info)
}

pub fn is_dynamic_base(path: &Path) -> Result<bool> {
	Ok(inspect_file(path)?.is_dynamic_base())
}

pub fn patch_file(path: &Path, backup: &BackupPolicy) -> Result<FileOutcome> {
	let original = read_file(path)?;
	let mut patched = original.clone();

	let outcome = clear_dynamic_base(&mut patched)
		.with_context(|| format!("Couldn't patch {:?}", path))?;
	let (old, new) = outcome.values();
	if !outcome.was_modified() {
		debug!("DllCharacteristics 0x{:04X} already clear", old);
		return Ok(FileOutcome::AlreadyCleared);
	}

	// Checked before the backup so a readonly file leaves no stray copy
	ensure_writable(path)?;

	let backup = if backup.enabled {
		Some(make_backup(path, &original, &backup.extension)?)
	} else {
		warn!("Patching {:?} without a backup", path);
		None
	};

	std::fs::write(path, &patched).map_err(|source| FileError::WriteFailed {
		path: path.to_path_buf(),
		source,
	})?;
	if is_dynamic_base(path)? {
		return Err(anyhow!("DYNAMIC_BASE still set after writing {:?}", path));
	}
	info!(
		"Cleared DYNAMIC_BASE in {:?}: 0x{:04X} -> 0x{:04X}",
		path, old, new
	);

	Ok(FileOutcome::Patched { backup, old, new })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pe::test_image::{build, NT_OFFSET};
	use crate::pe::OptionalHeaderKind;

	const FIELD: usize = NT_OFFSET + 94;

	fn read_field(data: &[u8]) -> u16 {
		LittleEndian::read_u16(&data[FIELD..FIELD + 2])
	}

	#[test]
	fn clears_flag_in_pe32_plus() {
		let mut data = build(OptionalHeaderKind::Pe32Plus, 0x0140);
		let outcome = clear_dynamic_base(&mut data).unwrap();
		assert_eq!(
			outcome,
			PatchOutcome::Modified {
				old: 0x0140,
				new: 0x0100
			}
		);
		assert_eq!(read_field(&data), 0x0100);
	}

	#[test]
	fn clears_flag_in_pe32() {
		let mut data = build(OptionalHeaderKind::Pe32, 0x0140);
		assert!(clear_dynamic_base(&mut data).unwrap().was_modified());
		assert_eq!(read_field(&data), 0x0100);
		assert_eq!(read_field(&data) & IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE, 0);
	}

	#[test]
	fn flag_already_clear_leaves_buffer_untouched() {
		let mut data = build(OptionalHeaderKind::Pe32Plus, 0x0100);
		let before = data.clone();
		assert_eq!(
			clear_dynamic_base(&mut data),
			Ok(PatchOutcome::Unmodified { value: 0x0100 })
		);
		assert_eq!(data, before);
	}

	#[test]
	fn second_patch_is_a_no_op() {
		let mut data = build(OptionalHeaderKind::Pe32, 0xC160);
		assert!(clear_dynamic_base(&mut data).unwrap().was_modified());
		let once = data.clone();
		assert!(!clear_dynamic_base(&mut data).unwrap().was_modified());
		assert_eq!(data, once);
	}

	#[test]
	fn only_dll_characteristics_bytes_change() {
		for kind in [OptionalHeaderKind::Pe32, OptionalHeaderKind::Pe32Plus] {
			let mut data = build(kind, 0xFFFF);
			// fill the rest of the optional header with noise
			for (i, byte) in data.iter_mut().enumerate().skip(NT_OFFSET + 26) {
				if i != FIELD && i != FIELD + 1 {
					*byte = (i * 31 % 251) as u8;
				}
			}
			data.extend_from_slice(&[0xAA; 512]);
			let before = data.clone();

			clear_dynamic_base(&mut data).unwrap();

			assert_eq!(data.len(), before.len());
			let changed: Vec<usize> = (0..data.len()).filter(|&i| data[i] != before[i]).collect();
			assert_eq!(changed, vec![FIELD], "{}", kind);
			assert_eq!(read_field(&data), 0xFFBF);
		}
	}

	#[test]
	fn errors_do_not_mutate() {
		let mut small = vec![0u8; 10];
		assert_eq!(clear_dynamic_base(&mut small), Err(PatchError::TooSmall));
		assert_eq!(small, vec![0u8; 10]);

		let mut unknown = build(OptionalHeaderKind::Pe32Plus, 0x0140);
		LittleEndian::write_u16(&mut unknown[NT_OFFSET + 24..], 0x0000);
		let before = unknown.clone();
		assert_eq!(
			clear_dynamic_base(&mut unknown),
			Err(PatchError::UnknownOptionalHeaderType(0))
		);
		assert_eq!(unknown, before);
	}

	#[test]
	fn patch_file_writes_backup_and_clears_flag() {
		let dir = tempfile::tempdir().unwrap();
		let exe = dir.path().join("app.exe");
		let original = build(OptionalHeaderKind::Pe32Plus, 0x0160);
		std::fs::write(&exe, &original).unwrap();

		let outcome = patch_file(&exe, &BackupPolicy::default()).unwrap();
		let backup = dir.path().join("app.exe.bak");
		assert_eq!(
			outcome,
			FileOutcome::Patched {
				backup: Some(backup.clone()),
				old: 0x0160,
				new: 0x0120
			}
		);
		assert_eq!(std::fs::read(&backup).unwrap(), original);
		assert_eq!(read_field(&std::fs::read(&exe).unwrap()), 0x0120);
		assert!(!is_dynamic_base(&exe).unwrap());
	}

	#[test]
	fn patch_file_respects_backup_policy() {
		let dir = tempfile::tempdir().unwrap();
		let exe = dir.path().join("lib.dll");
		std::fs::write(&exe, build(OptionalHeaderKind::Pe32, 0x0040)).unwrap();

		let policy = BackupPolicy {
			enabled: false,
			extension: "bak".to_string(),
		};
		let outcome = patch_file(&exe, &policy).unwrap();
		assert!(matches!(outcome, FileOutcome::Patched { backup: None, .. }));
		assert!(!dir.path().join("lib.dll.bak").exists());

		std::fs::write(&exe, build(OptionalHeaderKind::Pe32, 0x0040)).unwrap();
		let policy = BackupPolicy {
			enabled: true,
			extension: "orig".to_string(),
		};
		patch_file(&exe, &policy).unwrap();
		assert!(dir.path().join("lib.dll.orig").exists());
	}

	#[test]
	fn already_cleared_file_is_not_rewritten() {
		let dir = tempfile::tempdir().unwrap();
		let exe = dir.path().join("app.exe");
		std::fs::write(&exe, build(OptionalHeaderKind::Pe32Plus, 0x0100)).unwrap();

		let outcome = patch_file(&exe, &BackupPolicy::default()).unwrap();
		assert_eq!(outcome, FileOutcome::AlreadyCleared);
		assert!(!dir.path().join("app.exe.bak").exists());
	}

	#[test]
	fn invalid_file_reports_reason_and_is_untouched() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("notes.txt");
		std::fs::write(&path, "just some text\n".repeat(20)).unwrap();

		let err = patch_file(&path, &BackupPolicy::default()).unwrap_err();
		assert_eq!(
			err.downcast_ref::<PatchError>(),
			Some(&PatchError::NotAPEFile)
		);
		assert!(!dir.path().join("notes.txt.bak").exists());
	}

	#[test]
	fn missing_file_is_read_failure() {
		let dir = tempfile::tempdir().unwrap();
		let err = patch_file(&dir.path().join("missing.exe"), &BackupPolicy::default()).unwrap_err();
		assert!(matches!(
			err.downcast_ref::<FileError>(),
			Some(FileError::ReadFailed { .. })
		));
	}

	#[test]
	fn outcome_values() {
		let modified = PatchOutcome::Modified {
			old: 0x0160,
			new: 0x0120,
		};
		assert!(modified.was_modified());
		assert_eq!(modified.values(), (0x0160, 0x0120));

		let unmodified = PatchOutcome::Unmodified { value: 0x0100 };
		assert!(!unmodified.was_modified());
		assert_eq!(unmodified.values(), (0x0100, 0x0100));
	}

	#[test]
	fn is_dynamic_base_reads_without_writing() {
		let dir = tempfile::tempdir().unwrap();
		let exe = dir.path().join("app.exe");
		let original = build(OptionalHeaderKind::Pe32, 0x0140);
		std::fs::write(&exe, &original).unwrap();

		assert!(is_dynamic_base(&exe).unwrap());
		assert_eq!(std::fs::read(&exe).unwrap(), original);

		std::fs::write(&exe, build(OptionalHeaderKind::Pe32, 0x0100)).unwrap();
		assert!(!is_dynamic_base(&exe).unwrap());
	}

	#[test]
	fn inspect_missing_file_is_read_failure() {
		let dir = tempfile::tempdir().unwrap();
		let err = inspect_file(&dir.path().join("missing.exe")).unwrap_err();
		assert!(matches!(
			err.downcast_ref::<FileError>(),
			Some(FileError::ReadFailed { .. })
		));
	}

	#[test]
	fn unwritable_backup_aborts_before_writing() {
		let dir = tempfile::tempdir().unwrap();
		let exe = dir.path().join("app.exe");
		let original = build(OptionalHeaderKind::Pe32Plus, 0x0140);
		std::fs::write(&exe, &original).unwrap();
		std::fs::create_dir(dir.path().join("app.exe.bak")).unwrap();

		let err = patch_file(&exe, &BackupPolicy::default()).unwrap_err();
		assert!(matches!(
			err.downcast_ref::<FileError>(),
			Some(FileError::BackupFailed { .. })
		));
		assert_eq!(std::fs::read(&exe).unwrap(), original);
	}

	#[test]
	fn readonly_file_is_write_failure() {
		let dir = tempfile::tempdir().unwrap();
		let exe = dir.path().join("app.exe");
		let original = build(OptionalHeaderKind::Pe32Plus, 0x0140);
		std::fs::write(&exe, &original).unwrap();
		let mut permissions = std::fs::metadata(&exe).unwrap().permissions();
		permissions.set_readonly(true);
		std::fs::set_permissions(&exe, permissions).unwrap();

		let err = patch_file(&exe, &BackupPolicy::default()).unwrap_err();
		assert!(matches!(
			err.downcast_ref::<FileError>(),
			Some(FileError::WriteFailed { .. })
		));
		assert_eq!(std::fs::read(&exe).unwrap(), original);
		assert!(!dir.path().join("app.exe.bak").exists());
	}
}
