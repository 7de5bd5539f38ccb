//! Heuristic classification of opaque memory blocks.
//!
//! Given nothing but a pointer and the recorded allocation size, the
//! classifier decides whether the bytes look like an object with a
//! method-table header, a length-prefixed text buffer, or neither. The
//! result is only ever used to annotate reports; a wrong guess costs a
//! misleading line, never correctness.
//!
//! # Recognized layouts
//!
//! **Object**: the first word of the payload is a candidate method-table
//! address. A valid method table carries, at word offsets from its own
//! address: `0`, a self-referential pointer (the table points at itself);
//! `1`, the parent table (null for a root type); `2`, a pointer to the
//! type name as a length-prefixed ASCII identifier (`u8` length, then the
//! bytes). Parent chains are validated recursively up to
//! [`MAX_TYPE_DEPTH`], which guards against corrupt or cyclic data. Every
//! read outside the tracked block is gated on the injected
//! [`MemoryProbe`]; without a probe the object test is skipped.
//!
//! **Text buffer**: the payload starts with a [`TEXT_HEADER_SIZE`]-byte
//! header of little-endian `u32` fields (reference count, element width
//! of 1 or 2 bytes, element count, reserved) followed by the character
//! data and a zero terminator. The claimed length must fit the recorded
//! allocation size and every unit must be printable ASCII.
//!
//! Classification is recomputed on every examination and never stored.

use std::fmt;
use std::ptr;

use crate::hooks::MemoryProbe;

/// Recursion bound for parent-table chains. Deeper hierarchies than this
/// are treated as corrupt data rather than objects.
pub const MAX_TYPE_DEPTH: usize = 8;

/// Longest type name the object test accepts, matching the capacity of the
/// length-prefixed name format.
pub const MAX_TYPE_NAME_LEN: usize = 127;

/// Size of the text-buffer header preceding the character data.
pub const TEXT_HEADER_SIZE: usize = 16;

const WORD: usize = size_of::<usize>();

/// The classifier's verdict for one block. Derived on demand, never stored.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Classification {
    /// The block starts with a valid method-table chain.
    Object(TypeName),
    /// The block holds a length-prefixed printable text buffer.
    Text(TextInfo),
    /// Neither heuristic matched; reports fall back to a hex dump.
    Unknown,
}

impl Classification {
    /// The resolved type name, when the block classified as an object.
    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Self::Object(name) => Some(name.as_str()),
            Self::Text(_) | Self::Unknown => None,
        }
    }
}

/// A type name resolved from a method table, stored inline so that
/// classification never allocates through the tracked path.
#[derive(Clone)]
pub struct TypeName {
    bytes: [u8; MAX_TYPE_NAME_LEN],
    len: u8,
}

impl TypeName {
    fn from_ascii(name: &[u8]) -> Self {
        debug_assert!(name.len() <= MAX_TYPE_NAME_LEN);
        let mut bytes = [0_u8; MAX_TYPE_NAME_LEN];
        bytes[..name.len()].copy_from_slice(name);
        Self {
            bytes,
            len: u8::try_from(name.len()).expect("bounded by MAX_TYPE_NAME_LEN"),
        }
    }

    /// The name as text. Always pure ASCII.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Validated as ASCII identifier characters at construction.
        std::str::from_utf8(&self.bytes[..usize::from(self.len)])
            .expect("type name was validated ASCII")
    }
}

impl fmt::Debug for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeName").field(&self.as_str()).finish()
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq for TypeName {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for TypeName {}

/// Facts recovered from a text-buffer header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct TextInfo {
    /// Bytes per character unit: 1 or 2.
    pub elem_width: u32,
    /// Reference count claimed by the header.
    pub refcount: u32,
    /// Number of character units, excluding the terminator.
    pub chars: u32,
}

/// Classifies the `size` payload bytes at `payload`.
///
/// # Safety
///
/// `payload` must be valid for reads of `size` bytes for the duration of
/// the call (in practice: a live tracked block, examined under the tracker
/// lock).
pub(crate) unsafe fn classify(
    payload: *const u8,
    size: usize,
    probe: Option<&dyn MemoryProbe>,
) -> Classification {
    // SAFETY: In-block read per function contract.
    if let Some(name) = unsafe { classify_object(payload, size, probe) } {
        return Classification::Object(name);
    }
    // SAFETY: In-block reads per function contract.
    if let Some(info) = unsafe { classify_text(payload, size) } {
        return Classification::Text(info);
    }
    Classification::Unknown
}

/// The object test. Requires a probe: it chases pointers out of the block,
/// and a wild read cannot be recovered in-process.
///
/// # Safety
///
/// `payload` must be valid for reads of `size` bytes.
unsafe fn classify_object(
    payload: *const u8,
    size: usize,
    probe: Option<&dyn MemoryProbe>,
) -> Option<TypeName> {
    let probe = probe?;
    if size < WORD {
        return None;
    }
    // SAFETY: At least one word of payload exists per the size check.
    let candidate = unsafe { payload.cast::<usize>().read_unaligned() };
    validate_method_table(candidate, probe, 0)
}

fn validate_method_table(
    table: usize,
    probe: &dyn MemoryProbe,
    depth: usize,
) -> Option<TypeName> {
    if depth > MAX_TYPE_DEPTH {
        return None;
    }
    // Method tables are word-aligned by construction; reject the rest
    // before bothering the probe.
    if table == 0 || table % WORD != 0 {
        return None;
    }
    if !probe.is_readable(table, 3 * WORD) {
        return None;
    }

    // SAFETY: The probe vouched for 3 words at `table`.
    let (self_ptr, parent, name_ptr) = unsafe {
        let base = ptr::with_exposed_provenance::<usize>(table);
        (base.read(), base.add(1).read(), base.add(2).read())
    };

    if self_ptr != table {
        return None;
    }
    if parent != 0 && validate_method_table(parent, probe, depth + 1).is_none() {
        return None;
    }
    read_type_name(name_ptr, probe)
}

fn read_type_name(name_ptr: usize, probe: &dyn MemoryProbe) -> Option<TypeName> {
    if name_ptr == 0 || !probe.is_readable(name_ptr, 1) {
        return None;
    }
    // SAFETY: The probe vouched for one byte at `name_ptr`.
    let len = usize::from(unsafe { ptr::with_exposed_provenance::<u8>(name_ptr).read() });
    if len == 0 || len > MAX_TYPE_NAME_LEN {
        return None;
    }
    if !probe.is_readable(name_ptr + 1, len) {
        return None;
    }

    let mut bytes = [0_u8; MAX_TYPE_NAME_LEN];
    for (index, slot) in bytes.iter_mut().enumerate().take(len) {
        // SAFETY: The probe vouched for `len` bytes at `name_ptr + 1`.
        *slot = unsafe { ptr::with_exposed_provenance::<u8>(name_ptr + 1 + index).read() };
    }

    let name = &bytes[..len];
    let leading_valid = name[0].is_ascii_alphabetic() || name[0] == b'_';
    let rest_valid = name
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b':');
    if !(leading_valid && rest_valid) {
        return None;
    }
    Some(TypeName::from_ascii(name))
}

/// The text-buffer test. Reads only inside the block, so it needs no probe
/// and always runs.
///
/// # Safety
///
/// `payload` must be valid for reads of `size` bytes.
unsafe fn classify_text(payload: *const u8, size: usize) -> Option<TextInfo> {
    if size < TEXT_HEADER_SIZE {
        return None;
    }

    // SAFETY: Header fits per the size check; all in-block reads below stay
    // within `size` bytes as validated before each one.
    unsafe {
        let read_u32 =
            |offset: usize| -> u32 { payload.add(offset).cast::<u32>().read_unaligned() };
        let refcount = read_u32(0);
        let elem_width = read_u32(4);
        let chars = read_u32(8);

        if !(elem_width == 1 || elem_width == 2) || refcount == 0 {
            return None;
        }

        let width = elem_width as usize;
        let units = chars as usize;
        // Character data plus terminator must fit the recorded size.
        let needed = units
            .checked_add(1)?
            .checked_mul(width)?
            .checked_add(TEXT_HEADER_SIZE)?;
        if needed > size {
            return None;
        }

        let data = payload.add(TEXT_HEADER_SIZE);
        for index in 0..=units {
            let unit = match width {
                1 => u16::from(data.add(index).read()),
                _ => data.cast::<u16>().add(index).read_unaligned(),
            };
            let expected_terminator = index == units;
            if expected_terminator {
                if unit != 0 {
                    return None;
                }
            } else if !(0x20..=0x7E).contains(&unit) {
                return None;
            }
        }

        Some(TextInfo {
            elem_width,
            refcount,
            chars,
        })
    }
}

/// Reads the character unit at `index` of a validated text buffer, as a
/// byte (wide units are truncated to their low byte, which validation has
/// confirmed covers the whole value).
///
/// # Safety
///
/// `payload`/`info` must come from a successful [`classify_text`] run on a
/// block that is still live.
pub(crate) unsafe fn text_unit(payload: *const u8, info: &TextInfo, index: usize) -> u8 {
    debug_assert!(index < info.chars as usize);
    // SAFETY: Validation confirmed the unit range fits inside the block.
    unsafe {
        let data = payload.add(TEXT_HEADER_SIZE);
        match info.elem_width {
            1 => data.add(index).read(),
            _ => (data.cast::<u16>().add(index).read_unaligned() & 0xFF) as u8,
        }
    }
}
