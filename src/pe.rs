//! Cross-platform PE (Portable Executable) header layout.
//! Fields are read by offset from the raw file bytes, never through struct casts.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

// Constants
pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // MZ
pub const IMAGE_NT_SIGNATURE: u32 = 0x00004550; // PE\0\0
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10B;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;

/// Size of IMAGE_DOS_HEADER
pub const DOS_HEADER_SIZE: usize = 64;
/// Offset of e_lfanew within the DOS header
pub const E_LFANEW_OFFSET: usize = 0x3C;
pub const NT_SIGNATURE_SIZE: usize = 4;
/// Size of IMAGE_FILE_HEADER
pub const FILE_HEADER_SIZE: usize = 20;
/// Offset of the optional header from the start of the NT headers
pub const OPTIONAL_HEADER_OFFSET: usize = NT_SIGNATURE_SIZE + FILE_HEADER_SIZE;
/// Size of IMAGE_NT_HEADERS64, the larger of the two layouts. Used as the
/// bounds check for both.
pub const NT_HEADERS64_SIZE: usize = OPTIONAL_HEADER_OFFSET + 240;
/// Offset of DllCharacteristics within the optional header. Both layouts
/// realign after ImageBase, so this is 0x46 for PE32 and PE32+ alike.
pub const DLL_CHARACTERISTICS_OFFSET: usize = 70;

pub const IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA: u16 = 0x0020;
pub const IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE: u16 = 0x0040;
pub const IMAGE_DLLCHARACTERISTICS_FORCE_INTEGRITY: u16 = 0x0080;
pub const IMAGE_DLLCHARACTERISTICS_NX_COMPAT: u16 = 0x0100;
pub const IMAGE_DLLCHARACTERISTICS_NO_ISOLATION: u16 = 0x0200;
pub const IMAGE_DLLCHARACTERISTICS_NO_SEH: u16 = 0x0400;
pub const IMAGE_DLLCHARACTERISTICS_NO_BIND: u16 = 0x0800;
pub const IMAGE_DLLCHARACTERISTICS_APPCONTAINER: u16 = 0x1000;
pub const IMAGE_DLLCHARACTERISTICS_WDM_DRIVER: u16 = 0x2000;
pub const IMAGE_DLLCHARACTERISTICS_GUARD_CF: u16 = 0x4000;
pub const IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE: u16 = 0x8000;

const DLL_CHARACTERISTIC_NAMES: [(u16, &str); 11] = [
	(IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA, "HIGH_ENTROPY_VA"),
	(IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE, "DYNAMIC_BASE"),
	(IMAGE_DLLCHARACTERISTICS_FORCE_INTEGRITY, "FORCE_INTEGRITY"),
	(IMAGE_DLLCHARACTERISTICS_NX_COMPAT, "NX_COMPAT"),
	(IMAGE_DLLCHARACTERISTICS_NO_ISOLATION, "NO_ISOLATION"),
	(IMAGE_DLLCHARACTERISTICS_NO_SEH, "NO_SEH"),
	(IMAGE_DLLCHARACTERISTICS_NO_BIND, "NO_BIND"),
	(IMAGE_DLLCHARACTERISTICS_APPCONTAINER, "APPCONTAINER"),
	(IMAGE_DLLCHARACTERISTICS_WDM_DRIVER, "WDM_DRIVER"),
	(IMAGE_DLLCHARACTERISTICS_GUARD_CF, "GUARD_CF"),
	(IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE, "TERMINAL_SERVER_AWARE"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PatchError {
	#[error("file too small")]
	TooSmall,
	#[error("not a PE file (MZ missing)")]
	NotAPEFile,
	#[error("invalid e_lfanew")]
	InvalidHeaderOffset,
	#[error("PE signature missing")]
	MissingPESignature,
	#[error("unknown PE optional header type (magic 0x{0:X})")]
	UnknownOptionalHeaderType(u16),
}

/// Optional header layout, selected by its magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionalHeaderKind {
	Pe32,
	Pe32Plus,
}

impl OptionalHeaderKind {
	pub fn from_magic(magic: u16) -> Option<Self> {
		match magic {
			IMAGE_NT_OPTIONAL_HDR32_MAGIC => Some(OptionalHeaderKind::Pe32),
			IMAGE_NT_OPTIONAL_HDR64_MAGIC => Some(OptionalHeaderKind::Pe32Plus),
			_ => None,
		}
	}

	pub fn optional_header_size(self) -> usize {
		match self {
			OptionalHeaderKind::Pe32 => 224,
			OptionalHeaderKind::Pe32Plus => 240,
		}
	}

	/// Offset of ImageBase within the optional header. PE32 carries BaseOfData
	/// first and a 4 byte ImageBase; PE32+ drops BaseOfData and widens ImageBase to 8.
	pub fn image_base_offset(self) -> usize {
		match self {
			OptionalHeaderKind::Pe32 => 28,
			OptionalHeaderKind::Pe32Plus => 24,
		}
	}
}

impl fmt::Display for OptionalHeaderKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OptionalHeaderKind::Pe32 => write!(f, "PE32 (32-bit)"),
			OptionalHeaderKind::Pe32Plus => write!(f, "PE32+ (64-bit)"),
		}
	}
}

/// Validates the DOS header and returns the offset of the NT headers.
pub fn locate_nt_header(data: &[u8]) -> Result<usize, PatchError> {
	if data.len() < DOS_HEADER_SIZE {
		return Err(PatchError::TooSmall);
	}

	let e_magic = LittleEndian::read_u16(&data[0..2]);
	if e_magic != IMAGE_DOS_SIGNATURE {
		return Err(PatchError::NotAPEFile);
	}

	let e_lfanew = LittleEndian::read_u32(&data[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4]) as usize;
	match e_lfanew.checked_add(NT_HEADERS64_SIZE) {
		Some(end) if end <= data.len() => {}
		_ => {
			debug!(
				"e_lfanew 0x{:x} out of bounds for {} byte buffer",
				e_lfanew,
				data.len()
			);
			return Err(PatchError::InvalidHeaderOffset);
		}
	}

	let signature = LittleEndian::read_u32(&data[e_lfanew..e_lfanew + NT_SIGNATURE_SIZE]);
	if signature != IMAGE_NT_SIGNATURE {
		return Err(PatchError::MissingPESignature);
	}

	trace!("NT headers at 0x{:x}", e_lfanew);
	Ok(e_lfanew)
}

/// Reads the optional header magic. `nt_offset` must come from [`locate_nt_header`].
pub fn classify_optional_header(
	data: &[u8],
	nt_offset: usize,
) -> Result<OptionalHeaderKind, PatchError> {
	let magic_offset = nt_offset + OPTIONAL_HEADER_OFFSET;
	let magic = data
		.get(magic_offset..magic_offset + 2)
		.map(LittleEndian::read_u16)
		.ok_or(PatchError::InvalidHeaderOffset)?;
	OptionalHeaderKind::from_magic(magic).ok_or(PatchError::UnknownOptionalHeaderType(magic))
}

/// Absolute file offset of DllCharacteristics.
pub fn dll_characteristics_offset(nt_offset: usize) -> usize {
	nt_offset + OPTIONAL_HEADER_OFFSET + DLL_CHARACTERISTICS_OFFSET
}

/// Read-only summary of the headers, used by `check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeHeaderInfo {
	pub nt_offset: usize,
	pub kind: OptionalHeaderKind,
	pub image_base: u64,
	pub dll_characteristics_offset: usize,
	pub dll_characteristics: u16,
}

impl PeHeaderInfo {
	pub fn is_dynamic_base(&self) -> bool {
		self.dll_characteristics & IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE != 0
	}
}

pub fn inspect(data: &[u8]) -> Result<PeHeaderInfo, PatchError> {
	let nt_offset = locate_nt_header(data)?;
	let kind = classify_optional_header(data, nt_offset)?;

	// Everything below is inside the NT_HEADERS64_SIZE region already bounds checked
	let image_base_at = nt_offset + OPTIONAL_HEADER_OFFSET + kind.image_base_offset();
	let image_base = match kind {
		OptionalHeaderKind::Pe32 => LittleEndian::read_u32(&data[image_base_at..]) as u64,
		OptionalHeaderKind::Pe32Plus => LittleEndian::read_u64(&data[image_base_at..]),
	};
	let field = dll_characteristics_offset(nt_offset);
	let dll_characteristics = LittleEndian::read_u16(&data[field..field + 2]);

	Ok(PeHeaderInfo {
		nt_offset,
		kind,
		image_base,
		dll_characteristics_offset: field,
		dll_characteristics,
	})
}

pub fn describe_dll_characteristics(value: u16) -> Vec<&'static str> {
	DLL_CHARACTERISTIC_NAMES
		.iter()
		.filter(|(flag, _)| value & flag != 0)
		.map(|(_, name)| *name)
		.collect()
}
