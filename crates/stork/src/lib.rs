//! ELF process-image loading for bring-up.
//!
//! One-shot and non-concurrent: a process image is loaded exactly once, at
//! construction. The loader walks the `PT_LOAD` program headers and decides
//! placement; the actual mappings are delegated to a [`SegmentMapper`] so
//! the arithmetic stays independent of any particular memory backend.
//!
//! Two placement modes exist. An image whose first loadable segment has a
//! non-zero virtual address is fixed: every segment maps at its (page
//! aligned) `p_vaddr` and the header's entry point is used as-is. An image
//! whose first loadable segment sits at virtual address zero is position
//! independent: the backend (or a caller hint) picks the base, subsequent
//! segments map at their offsets from it, and the entry point is rebased by
//! the chosen base. Any failure is terminal; no partial image is usable.

#![cfg_attr(not(test), no_std)]

use core::{error::Error, fmt::Display};

use bitflags::bitflags;
use log::debug;

/// Loadable-segment program header type.
pub const PT_LOAD: u32 = 1;

const ELF_MAGIC: [u8; 4] = *b"\x7fELF";
const PAGE_SIZE: usize = 0x1000;
const EHDR_LEN: usize = 64;
const PHDR_LEN: usize = 0x38;

bitflags! {
    /// Segment protection, straight from the ELF `p_flags` bits.
    pub struct Prot: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

/// A successfully placed process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// Address of the first loadable segment.
    pub base: usize,
    /// Total in-memory span of all loadable segments.
    pub size: usize,
    /// Entry point, rebased for position-independent images.
    pub entry: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// Not a little-endian ELF64 image.
    BadImage,
    /// No `PT_LOAD` segment present.
    NoLoadSegments,
    /// A header or segment extends past the end of the file or the
    /// address space.
    Truncated,
    /// The mapping backend refused a segment.
    Map(MapError),
}

impl Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LoadError::BadImage => write!(f, "not a loadable ELF64 image"),
            LoadError::NoLoadSegments => write!(f, "image has no loadable segments"),
            LoadError::Truncated => write!(f, "image is truncated"),
            LoadError::Map(_) => write!(f, "mapping a segment failed"),
        }
    }
}

impl Error for LoadError {}

/// Failure from the mapping backend. Detail stays with the backend; for the
/// caller every mapping failure is equally terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapError;

impl Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "segment mapping failed")
    }
}

impl Error for MapError {}

impl From<MapError> for LoadError {
    fn from(err: MapError) -> Self {
        LoadError::Map(err)
    }
}

/// Mapping backend the loader delegates to.
pub trait SegmentMapper {
    /// Map `len` bytes, at `addr` exactly when given, otherwise at a
    /// placement of the backend's choosing. `data` is the file-backed
    /// prefix of the region; the backend zero-fills the remaining
    /// `len - data.len()` bytes. Returns the address actually mapped.
    fn map_segment(
        &mut self,
        addr: Option<usize>,
        len: usize,
        prot: Prot,
        data: &[u8],
    ) -> Result<usize, MapError>;
}

#[derive(Debug, Clone, Copy)]
struct Ehdr {
    entry: u64,
    phoff: u64,
    phentsize: u16,
    phnum: u16,
}

impl Ehdr {
    fn parse(image: &[u8]) -> Result<Self, LoadError> {
        if image.len() < EHDR_LEN {
            return Err(LoadError::BadImage);
        }
        // Magic, 64-bit class, little-endian data.
        if image[..4] != ELF_MAGIC || image[4] != 2 || image[5] != 1 {
            return Err(LoadError::BadImage);
        }
        Ok(Self {
            entry: read_u64(image, 24)?,
            phoff: read_u64(image, 32)?,
            phentsize: read_u16(image, 54)?,
            phnum: read_u16(image, 56)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Phdr {
    fn parse(image: &[u8], off: usize) -> Result<Self, LoadError> {
        Ok(Self {
            p_type: read_u32(image, off)?,
            p_flags: read_u32(image, off + 4)?,
            p_offset: read_u64(image, off + 8)?,
            p_vaddr: read_u64(image, off + 16)?,
            p_filesz: read_u64(image, off + 32)?,
            p_memsz: read_u64(image, off + 40)?,
        })
    }

    fn prot(&self) -> Prot {
        // Write access is forced on: the image gets fixed up in place after
        // loading.
        Prot::from_bits_truncate(self.p_flags) | Prot::WRITE
    }
}

/// Map every loadable segment of `image`, honoring a fixed load address for
/// non-position-independent images and `base_addr` (or backend placement,
/// when zero) for position-independent ones.
///
/// Returns the resulting base address, total mapped span and entry point.
pub fn load_image(
    image: &[u8],
    base_addr: usize,
    mapper: &mut dyn SegmentMapper,
) -> Result<LoadedImage, LoadError> {
    let ehdr = Ehdr::parse(image)?;
    let phdrs = ProgramHeaders::new(image, &ehdr);

    // First pass: placement mode and the total span of the loadable
    // segments. The span is needed up front so the first mapping can cover
    // all of it, keeping later fixed placements from colliding with
    // unrelated regions.
    let mut anywhere = false;
    let mut segment_base: Option<u64> = None;
    let mut load_span: usize = 0;
    let mut any_load = false;
    for phdr in phdrs.clone() {
        let phdr = phdr?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        if !any_load && phdr.p_vaddr == 0 {
            anywhere = true;
        }
        if !anywhere && segment_base.is_none() {
            segment_base = Some(phdr.p_vaddr);
        }
        let base = segment_base.unwrap_or(0);
        load_span = phdr
            .p_vaddr
            .checked_sub(base)
            .and_then(|off| off.checked_add(phdr.p_memsz))
            .ok_or(LoadError::Truncated)? as usize;
        any_load = true;
    }
    if !any_load {
        return Err(LoadError::NoLoadSegments);
    }

    // Second pass: map.
    let mut text_base: Option<usize> = None;
    let mut initial_vaddr: u64 = 0;
    let mut entry = ehdr.entry as usize;

    for phdr in phdrs {
        let phdr = phdr?;
        if phdr.p_type != PT_LOAD {
            continue;
        }

        let data_start = align_down(phdr.p_offset as usize, PAGE_SIZE);
        let data_end = phdr
            .p_offset
            .checked_add(phdr.p_filesz)
            .map(|end| end as usize)
            .filter(|&end| end <= image.len())
            .ok_or(LoadError::Truncated)?;
        let data = &image[data_start..data_end];

        let (addr, len) = match text_base {
            None => {
                let len = round_up(load_span, PAGE_SIZE).ok_or(LoadError::Truncated)?;
                let addr = if anywhere {
                    if base_addr != 0 {
                        Some(round_up(base_addr, PAGE_SIZE).ok_or(LoadError::Truncated)?)
                    } else {
                        None
                    }
                } else {
                    Some(align_down(phdr.p_vaddr as usize, PAGE_SIZE))
                };
                (addr, len)
            }
            Some(text) => {
                let aligned_vaddr = align_down(phdr.p_vaddr as usize, PAGE_SIZE);
                let end = (phdr.p_vaddr as usize)
                    .checked_add(phdr.p_memsz as usize)
                    .and_then(|end| round_up(end, PAGE_SIZE))
                    .ok_or(LoadError::Truncated)?;
                let len = end - aligned_vaddr;
                let addr = if anywhere {
                    align_down(
                        text + (phdr.p_vaddr - initial_vaddr) as usize,
                        PAGE_SIZE,
                    )
                } else {
                    aligned_vaddr
                };
                (Some(addr), len)
            }
        };

        let mapped = mapper.map_segment(addr, len, phdr.prot(), data)?;
        debug!(
            "mapped segment vaddr {:#x} at {:#x} (+{:#x})",
            phdr.p_vaddr, mapped, len
        );

        if text_base.is_none() {
            text_base = Some(mapped);
            initial_vaddr = phdr.p_vaddr;
            if anywhere {
                // Rebase the entry point by exactly the chosen placement.
                entry = entry
                    .wrapping_sub(phdr.p_vaddr as usize)
                    .wrapping_add(mapped);
            }
        }
    }

    let base = text_base.ok_or(LoadError::NoLoadSegments)?;
    Ok(LoadedImage {
        base,
        size: load_span,
        entry,
    })
}

/// Iterator over the program header table.
#[derive(Clone)]
struct ProgramHeaders<'a> {
    image: &'a [u8],
    phoff: usize,
    phentsize: usize,
    remaining: u16,
}

impl<'a> ProgramHeaders<'a> {
    fn new(image: &'a [u8], ehdr: &Ehdr) -> Self {
        Self {
            image,
            phoff: ehdr.phoff as usize,
            phentsize: (ehdr.phentsize as usize).max(PHDR_LEN),
            remaining: ehdr.phnum,
        }
    }
}

impl<'a> Iterator for ProgramHeaders<'a> {
    type Item = Result<Phdr, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let item = Phdr::parse(self.image, self.phoff);
        self.phoff += self.phentsize;
        Some(item)
    }
}

fn read_u16(image: &[u8], off: usize) -> Result<u16, LoadError> {
    let bytes = image
        .get(off..off + 2)
        .ok_or(LoadError::Truncated)?
        .try_into()
        .expect("slice length checked");
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32(image: &[u8], off: usize) -> Result<u32, LoadError> {
    let bytes = image
        .get(off..off + 4)
        .ok_or(LoadError::Truncated)?
        .try_into()
        .expect("slice length checked");
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(image: &[u8], off: usize) -> Result<u64, LoadError> {
    let bytes = image
        .get(off..off + 8)
        .ok_or(LoadError::Truncated)?
        .try_into()
        .expect("slice length checked");
    Ok(u64::from_le_bytes(bytes))
}

fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

// None when the next multiple does not fit in the address space.
fn round_up(value: usize, align: usize) -> Option<usize> {
    value.checked_next_multiple_of(align)
}
