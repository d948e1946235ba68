//! PE (Portable Executable) header layout and validation.
//! Fields are read at explicit, bounds-checked offsets instead of overlaying
//! structs on the buffer, so malformed input can never read out of range.

use byteorder::{ByteOrder, LittleEndian};
use std::ops::Range;
use thiserror::Error;

// DOS header
pub const IMAGE_DOS_HEADER_SIZE: usize = 64;
pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // MZ
const E_LFANEW_OFFSET: usize = 0x3C;

// NT headers
pub const IMAGE_NT_SIGNATURE: u32 = 0x00004550; // PE\0\0
pub const IMAGE_FILE_HEADER_SIZE: usize = 20;
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10B;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;
pub const IMAGE_NT_HEADERS64_SIZE: usize = 4 + IMAGE_FILE_HEADER_SIZE + 240;
const OPTIONAL_HEADER_OFFSET: usize = 4 + IMAGE_FILE_HEADER_SIZE;
const MACHINE_OFFSET: usize = 4;

pub const IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE: u16 = 0x0040;

/// Reasons a buffer is rejected before anything gets patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
	#[error("file too small")]
	TooSmall,
	#[error("not a recognized executable (missing signature)")]
	MissingDosSignature,
	#[error("invalid header offset")]
	InvalidHeaderOffset,
	#[error("executable signature missing")]
	MissingNtSignature,
	#[error("unknown header format")]
	UnknownFormat(u16),
}

/// Which optional header layout follows the COFF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionalHeaderKind {
	Pe32,
	Pe32Plus,
}

impl OptionalHeaderKind {
	fn from_magic(magic: u16) -> Option<Self> {
		match magic {
			IMAGE_NT_OPTIONAL_HDR64_MAGIC => Some(Self::Pe32Plus),
			IMAGE_NT_OPTIONAL_HDR32_MAGIC => Some(Self::Pe32),
			_ => None,
		}
	}

	/// Offset of `DllCharacteristics` from the start of the optional header.
	pub fn dll_characteristics_offset(self) -> usize {
		match self {
			// Magic(2) LinkerVersion(2) SizeOfCode..BaseOfCode(16) BaseOfData(4) ImageBase(4)
			// SectionAlignment..SizeOfHeaders(32) CheckSum(4) Subsystem(2)
			Self::Pe32 => 70,
			// Magic(2) LinkerVersion(2) SizeOfCode..BaseOfCode(16) ImageBase(8)
			// SectionAlignment..SizeOfHeaders(32) CheckSum(4) Subsystem(2)
			Self::Pe32Plus => 70,
		}
	}
}

impl std::fmt::Display for OptionalHeaderKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			OptionalHeaderKind::Pe32 => write!(f, "PE32 (32-bit)"),
			OptionalHeaderKind::Pe32Plus => write!(f, "PE32+ (64-bit)"),
		}
	}
}

/// Where the `DllCharacteristics` field of a validated image lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicsLocation {
	pub kind: OptionalHeaderKind,
	pub nt_headers_offset: usize,
	pub machine: u16,
	offset: usize,
}

impl CharacteristicsLocation {
	/// Absolute file offset of the field.
	pub fn offset(&self) -> usize {
		self.offset
	}

	pub fn range(&self) -> Range<usize> {
		self.offset..self.offset + 2
	}

	pub fn read(&self, image: &[u8]) -> Option<u16> {
		image.get(self.range()).map(LittleEndian::read_u16)
	}

	/// Mutable view of the two field bytes, `None` if `image` is not the buffer
	/// this location was computed from (or is shorter than it).
	pub fn field_mut<'a>(&self, image: &'a mut [u8]) -> Option<&'a mut [u8; 2]> {
		image.get_mut(self.range())?.try_into().ok()
	}
}

fn read_u16_at(image: &[u8], offset: usize) -> Option<u16> {
	image
		.get(offset..offset.checked_add(2)?)
		.map(LittleEndian::read_u16)
}

fn read_u32_at(image: &[u8], offset: usize) -> Option<u32> {
	image
		.get(offset..offset.checked_add(4)?)
		.map(LittleEndian::read_u32)
}

/// Validates the DOS and NT headers and finds `DllCharacteristics`.
///
/// Each check only runs once the previous one has established that the bytes
/// it reads are in bounds.
pub fn locate(image: &[u8]) -> Result<CharacteristicsLocation, ValidationError> {
	if image.len() < IMAGE_DOS_HEADER_SIZE {
		return Err(ValidationError::TooSmall);
	}

	if read_u16_at(image, 0) != Some(IMAGE_DOS_SIGNATURE) {
		return Err(ValidationError::MissingDosSignature);
	}

	let e_lfanew =
		read_u32_at(image, E_LFANEW_OFFSET).ok_or(ValidationError::TooSmall)? as usize;
	let nt_end = e_lfanew
		.checked_add(IMAGE_NT_HEADERS64_SIZE)
		.ok_or(ValidationError::InvalidHeaderOffset)?;
	if nt_end > image.len() {
		return Err(ValidationError::InvalidHeaderOffset);
	}

	if read_u32_at(image, e_lfanew) != Some(IMAGE_NT_SIGNATURE) {
		return Err(ValidationError::MissingNtSignature);
	}

	let optional_header = e_lfanew + OPTIONAL_HEADER_OFFSET;
	let magic =
		read_u16_at(image, optional_header).ok_or(ValidationError::InvalidHeaderOffset)?;
	let kind = OptionalHeaderKind::from_magic(magic).ok_or(ValidationError::UnknownFormat(magic))?;
	let machine = read_u16_at(image, e_lfanew + MACHINE_OFFSET)
		.ok_or(ValidationError::InvalidHeaderOffset)?;

	Ok(CharacteristicsLocation {
		kind,
		nt_headers_offset: e_lfanew,
		machine,
		offset: optional_header + kind.dll_characteristics_offset(),
	})
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	pub(crate) const TEST_E_LFANEW: usize = 0x80;

	/// Minimal image: DOS header, NT headers, and a tail of filler bytes so
	/// that anything touched outside the field shows up in comparisons.
	pub(crate) fn sample_image(magic: u16, dll_characteristics: u16) -> Vec<u8> {
		let len = TEST_E_LFANEW + IMAGE_NT_HEADERS64_SIZE + 0x100;
		let mut image: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
		LittleEndian::write_u16(&mut image[0..2], IMAGE_DOS_SIGNATURE);
		LittleEndian::write_u32(&mut image[0x3C..0x40], TEST_E_LFANEW as u32);
		let nt = TEST_E_LFANEW;
		LittleEndian::write_u32(&mut image[nt..nt + 4], IMAGE_NT_SIGNATURE);
		LittleEndian::write_u16(&mut image[nt + 4..nt + 6], 0x8664);
		let opt = nt + OPTIONAL_HEADER_OFFSET;
		LittleEndian::write_u16(&mut image[opt..opt + 2], magic);
		LittleEndian::write_u16(&mut image[opt + 70..opt + 72], dll_characteristics);
		image
	}

	/// xorshift, deterministic so failures are reproducible
	fn noise(seed: u64, len: usize) -> Vec<u8> {
		let mut state = seed | 1;
		(0..len)
			.map(|_| {
				state ^= state << 13;
				state ^= state >> 7;
				state ^= state << 17;
				state as u8
			})
			.collect()
	}

	#[test]
	fn short_buffers_are_too_small() {
		for len in 0..IMAGE_DOS_HEADER_SIZE {
			let mut image = vec![0u8; len];
			if len >= 2 {
				LittleEndian::write_u16(&mut image[0..2], IMAGE_DOS_SIGNATURE);
			}
			assert_eq!(locate(&image), Err(ValidationError::TooSmall), "len {len}");
		}
	}

	#[test]
	fn ten_zero_bytes() {
		let err = locate(&[0u8; 10]).unwrap_err();
		assert_eq!(err.to_string(), "file too small");
	}

	#[test]
	fn missing_mz() {
		let mut image = sample_image(IMAGE_NT_OPTIONAL_HDR64_MAGIC, 0x0140);
		image[0] = b'Z';
		assert_eq!(locate(&image), Err(ValidationError::MissingDosSignature));
		assert_eq!(
			ValidationError::MissingDosSignature.to_string(),
			"not a recognized executable (missing signature)"
		);
	}

	#[test]
	fn e_lfanew_past_end() {
		let mut image = sample_image(IMAGE_NT_OPTIONAL_HDR64_MAGIC, 0x0140);
		let past = (image.len() - IMAGE_NT_HEADERS64_SIZE + 1) as u32;
		LittleEndian::write_u32(&mut image[0x3C..0x40], past);
		assert_eq!(locate(&image), Err(ValidationError::InvalidHeaderOffset));

		LittleEndian::write_u32(&mut image[0x3C..0x40], u32::MAX);
		assert_eq!(locate(&image), Err(ValidationError::InvalidHeaderOffset));
	}

	#[test]
	fn e_lfanew_exactly_fits() {
		let mut image = sample_image(IMAGE_NT_OPTIONAL_HDR64_MAGIC, 0x0140);
		image.truncate(TEST_E_LFANEW + IMAGE_NT_HEADERS64_SIZE);
		let location = locate(&image).unwrap();
		assert_eq!(location.kind, OptionalHeaderKind::Pe32Plus);
	}

	#[test]
	fn missing_pe_signature() {
		let mut image = sample_image(IMAGE_NT_OPTIONAL_HDR64_MAGIC, 0x0140);
		image[TEST_E_LFANEW + 2] = 1;
		assert_eq!(locate(&image), Err(ValidationError::MissingNtSignature));
		assert_eq!(
			ValidationError::MissingNtSignature.to_string(),
			"executable signature missing"
		);
	}

	#[test]
	fn unknown_optional_magic() {
		let image = sample_image(0x0107, 0x0140);
		assert_eq!(locate(&image), Err(ValidationError::UnknownFormat(0x0107)));
		assert_eq!(
			ValidationError::UnknownFormat(0x0107).to_string(),
			"unknown header format"
		);
	}

	#[test]
	fn random_tail_after_mz_fails_cleanly() {
		for seed in 0..256u64 {
			let mut image = noise(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15), 512);
			LittleEndian::write_u16(&mut image[0..2], IMAGE_DOS_SIGNATURE);
			assert!(locate(&image).is_err(), "seed {seed}");
		}
	}

	#[test]
	fn random_tail_with_valid_offset_fails_cleanly() {
		for seed in 0..256u64 {
			let mut image = noise(seed + 1, 1024);
			LittleEndian::write_u16(&mut image[0..2], IMAGE_DOS_SIGNATURE);
			LittleEndian::write_u32(&mut image[0x3C..0x40], 0x100);
			assert_eq!(
				locate(&image),
				Err(ValidationError::MissingNtSignature),
				"seed {seed}"
			);
		}
	}

	#[test]
	fn locates_both_layouts() {
		let pe64 = locate(&sample_image(IMAGE_NT_OPTIONAL_HDR64_MAGIC, 0x0140)).unwrap();
		assert_eq!(pe64.kind, OptionalHeaderKind::Pe32Plus);
		assert_eq!(pe64.offset(), TEST_E_LFANEW + 24 + 70);
		assert_eq!(pe64.machine, 0x8664);

		let image = sample_image(IMAGE_NT_OPTIONAL_HDR32_MAGIC, 0x8140);
		let pe32 = locate(&image).unwrap();
		assert_eq!(pe32.kind, OptionalHeaderKind::Pe32);
		assert_eq!(pe32.read(&image), Some(0x8140));
	}

	#[test]
	fn field_mut_rejects_foreign_buffer() {
		let location = locate(&sample_image(IMAGE_NT_OPTIONAL_HDR64_MAGIC, 0x0140)).unwrap();
		let mut short = vec![0u8; 16];
		assert!(location.field_mut(&mut short).is_none());
	}
}
