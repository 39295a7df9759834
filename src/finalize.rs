//! Assembly of the final executable image.
//!
//! The finalizer stitches header, optional depacker, optional hash
//! block, model descriptor and compressed payload into one hunk based
//! at the image base, fills the header's symbolic slots from a table
//! of named patch descriptors, and applies the final relocations.

use crate::error::Error;
use crate::hunk::{Hunk, Symbol, SYMBOL_IS_RELOCATABLE};
use crate::hunklist::{relocate, HunkList};
use crate::modellist::{ModelList1k, ModelList4k};
use crate::stubs;

/// Maximum size of a finished executable.
pub const MAX_OUTPUT_SIZE: usize = 128 * 1024;

/// Subsystem byte values stored in the PE header.
pub const SUBSYSTEM_WINDOWS_GUI: u8 = 2;
pub const SUBSYSTEM_WINDOWS_CUI: u8 = 3;

/// Width and value of one header patch.
#[derive(Debug, Clone, Copy)]
enum Slot {
    U8(u8),
    U16(u16),
    U32(u32),
    /// Read-modify-write OR into a 16-bit slot.
    OrU16(u16),
}

#[derive(Debug, Clone, Copy)]
struct HeaderPatch {
    symbol: &'static str,
    slot: Slot,
}

/// Applies one table of patches to the flat image; every patch point
/// must exist and fit.
fn apply_patches(image: &mut Hunk, patches: &[HeaderPatch]) -> Result<(), Error> {
    for patch in patches {
        let offset = image
            .find_symbol(patch.symbol)
            .map(|s| s.value as usize)
            .ok_or_else(|| Error::PatchPointMissing { symbol: patch.symbol.to_string() })?;
        let width = match patch.slot {
            Slot::U8(_) => 1,
            Slot::U16(_) | Slot::OrU16(_) => 2,
            Slot::U32(_) => 4,
        };
        if offset + width > image.raw_size() {
            return Err(Error::PatchOutOfRange {
                symbol: patch.symbol.to_string(),
                offset,
                len: image.raw_size(),
            });
        }
        let data = image.data_mut();
        match patch.slot {
            Slot::U8(value) => data[offset] = value,
            Slot::U16(value) => data[offset..offset + 2].copy_from_slice(&value.to_le_bytes()),
            Slot::U32(value) => data[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
            Slot::OrU16(bits) => {
                let old = u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap());
                data[offset..offset + 2].copy_from_slice(&(old | bits).to_le_bytes());
            }
        }
    }
    Ok(())
}

/// Builds the model-descriptor hunk: for each half of the image, the
/// negated end address, the weight mask, and the mask bytes. The
/// negated addresses let the depacker detect the segment ends by
/// addition.
pub fn create_model_hunk(
    split_point: usize,
    raw_size: usize,
    code_models: &ModelList4k,
    data_models: &ModelList4k,
) -> Result<Hunk, Error> {
    // Both descriptors are terminated, so the model counts can be
    // recovered from the weight masks alone when the file is inspected.
    let (code_weightmask, code_masks) = code_models.mask_list(true)?;
    let (data_weightmask, data_masks) = data_models.mask_list(true)?;
    let mut bytes = Vec::with_capacity(16 + code_masks.len() + data_masks.len());
    bytes.extend_from_slice(
        &(crate::CODE_BASE.wrapping_add(split_point as u32)).wrapping_neg().to_le_bytes(),
    );
    bytes.extend_from_slice(&code_weightmask.to_le_bytes());
    bytes.extend_from_slice(&code_masks);
    bytes.extend_from_slice(
        &(crate::CODE_BASE.wrapping_add(raw_size as u32)).wrapping_neg().to_le_bytes(),
    );
    bytes.extend_from_slice(&data_weightmask.to_le_bytes());
    bytes.extend_from_slice(&data_masks);
    let mut hunk = Hunk::new("models", 0, 0, bytes, 0);
    hunk.add_symbol(Symbol::new(stubs::SYM_MODELS, 0, SYMBOL_IS_RELOCATABLE));
    Ok(hunk)
}

/// Splices the saturation instructions into a header or depacker blob
/// and adjusts the two neighbouring short-jump displacements.
pub fn set_header_saturation(blob: &mut Hunk) -> Result<(), Error> {
    const SATURATE_CODE: [u8; 5] = [0x75, 0x03, 0xfe, 0x0c, 0x1f];
    let offset = blob
        .find_symbol(stubs::SYM_SATURATE_PTR)
        .map(|s| s.value as usize)
        .ok_or_else(|| Error::PatchPointMissing { symbol: stubs::SYM_SATURATE_PTR.to_string() })?;
    let adjust1 = blob
        .find_symbol(stubs::SYM_SATURATE_ADJUST1_PTR)
        .map(|s| s.value as usize)
        .ok_or_else(|| Error::PatchPointMissing {
            symbol: stubs::SYM_SATURATE_ADJUST1_PTR.to_string(),
        })?;
    let adjust2 = blob
        .find_symbol(stubs::SYM_SATURATE_ADJUST2_PTR)
        .map(|s| s.value as usize)
        .ok_or_else(|| Error::PatchPointMissing {
            symbol: stubs::SYM_SATURATE_ADJUST2_PTR.to_string(),
        })?;
    let data = blob.data_mut();
    data[offset..offset + SATURATE_CODE.len()].copy_from_slice(&SATURATE_CODE);
    data[adjust1] = data[adjust1].wrapping_add(SATURATE_CODE.len() as u8);
    data[adjust2] = data[adjust2].wrapping_sub(SATURATE_CODE.len() as u8);
    Ok(())
}

/// Everything the final link needs besides the payload.
pub struct FinalizeParams<'a> {
    pub code_models: &'a ModelList4k,
    pub data_models: &'a ModelList4k,
    pub models_1k: &'a ModelList1k,
    pub split_point: usize,
    pub hashsize: u32,
    pub subsystem: u8,
    pub large_address_aware: bool,
    pub saturate: bool,
    /// RVA of the export directory, or zero.
    pub exports_rva: u32,
    pub tiny_header: bool,
}

/// Concatenates header, depacker, hashes, models and payload, assigns
/// addresses at the image base, patches the header slots and applies
/// the final relocations. `phase1` is the uncompressed flat image the
/// payload was made from; its sizes drive the layout constants.
pub fn final_link(
    mut header: Hunk,
    depacker: Option<Hunk>,
    hash_hunk: Option<Hunk>,
    phase1: &Hunk,
    packed: &[u8],
    params: &FinalizeParams,
) -> Result<Hunk, Error> {
    let mut packed_hunk = Hunk::new("compressed data", 0, 0, packed.to_vec(), 0);
    packed_hunk.add_symbol(Symbol::new(stubs::SYM_PACKED_DATA, 0, SYMBOL_IS_RELOCATABLE));

    let mut model_hunk = None;
    if !params.tiny_header {
        header.add_symbol(Symbol::new(
            stubs::SYM_HASH_TABLE,
            (2 * crate::SECTION_SIZE).wrapping_add(phase1.raw_size() as u32),
            SYMBOL_IS_RELOCATABLE,
        ));
        model_hunk = Some(create_model_hunk(
            params.split_point,
            phase1.raw_size(),
            params.code_models,
            params.data_models,
        )?);
        if params.saturate {
            set_header_saturation(&mut header)?;
        }
    }

    let mut list = HunkList::new();
    list.push_back(header);
    if let Some(depacker) = depacker {
        list.push_back(depacker);
    }
    if let Some(hash_hunk) = hash_hunk {
        list.push_back(hash_hunk);
    }
    if let Some(model_hunk) = model_hunk {
        list.push_back(model_hunk);
    }
    list.push_back(packed_hunk);
    let (mut image, _) = list.flatten("final");

    set_header_constants(&mut image, phase1, params)?;
    relocate(&mut image, crate::IMAGE_BASE)?;

    if image.raw_size() > MAX_OUTPUT_SIZE {
        return Err(Error::OutputTooLarge { size: image.raw_size(), max: MAX_OUTPUT_SIZE });
    }
    Ok(image)
}

fn set_header_constants(
    image: &mut Hunk,
    phase1: &Hunk,
    params: &FinalizeParams,
) -> Result<(), Error> {
    // Constants consumed by relocations inside the blobs.
    image.add_symbol(Symbol::new(stubs::SYM_HASH_TABLE_SIZE, params.hashsize / 2, 0));
    image.add_symbol(Symbol::new(stubs::SYM_UNPACKED_DATA, crate::CODE_BASE, 0));
    image.add_symbol(Symbol::new(stubs::SYM_IMAGE_BASE, crate::IMAGE_BASE, 0));
    image.add_symbol(Symbol::new(stubs::SYM_MODEL_MASK, params.models_1k.modelmask, 0));

    let mut patches: Vec<HeaderPatch> = vec![
        HeaderPatch { symbol: stubs::SYM_SUBSYSTEM_PTR, slot: Slot::U8(params.subsystem) },
        HeaderPatch {
            symbol: stubs::SYM_LINKER_VERSION_PTR,
            slot: Slot::U16(u16::from_le_bytes([
                crate::LINKER_VERSION_MAJOR,
                crate::LINKER_VERSION_MINOR,
            ])),
        },
    ];
    if params.large_address_aware {
        patches.push(HeaderPatch {
            symbol: stubs::SYM_CHARACTERISTICS_PTR,
            slot: Slot::OrU16(0x0020),
        });
    }
    if params.tiny_header {
        let high_offset = image
            .find_symbol(stubs::SYM_VIRTUAL_SIZE_HIGH_PTR)
            .map(|s| s.value as usize)
            .ok_or_else(|| Error::PatchPointMissing {
                symbol: stubs::SYM_VIRTUAL_SIZE_HIGH_PTR.to_string(),
            })?;
        let low_bytes = image.read_u32(high_offset - 3) & 0x00ff_ffff;
        let virtual_size = phase1.virtual_size() as u32 + 2 * crate::SECTION_SIZE;
        let high_byte = (virtual_size.wrapping_sub(low_bytes).wrapping_add(0x00ff_ffff) >> 24) as u8;
        patches.push(HeaderPatch {
            symbol: stubs::SYM_BASEPROB0_PTR,
            slot: Slot::U8(params.models_1k.baseprob0 as u8),
        });
        patches.push(HeaderPatch {
            symbol: stubs::SYM_BASEPROB1_PTR,
            slot: Slot::U8(params.models_1k.baseprob1 as u8),
        });
        patches.push(HeaderPatch {
            symbol: stubs::SYM_BOOST_FACTOR_PTR,
            slot: Slot::U8(params.models_1k.boost as u8),
        });
        patches.push(HeaderPatch {
            symbol: stubs::SYM_DEPACK_END_PTR,
            slot: Slot::U16(
                crate::CODE_BASE.wrapping_add(phase1.raw_size() as u32) as u16,
            ),
        });
        patches.push(HeaderPatch {
            symbol: stubs::SYM_VIRTUAL_SIZE_HIGH_PTR,
            slot: Slot::U8(high_byte),
        });
    } else {
        // The depacker needs room for both the unpacked image and the
        // runtime counter table.
        let virtual_size = (phase1.virtual_size() as u32)
            .max(phase1.raw_size() as u32 + params.hashsize)
            .next_multiple_of(16);
        image.add_symbol(Symbol::new(stubs::SYM_VIRTUAL_SIZE, virtual_size, 0));
        patches.push(HeaderPatch {
            symbol: stubs::SYM_BASEPROB_PTR,
            slot: Slot::U8(crate::compress::BASE_PROB as u8),
        });
        patches.push(HeaderPatch {
            symbol: stubs::SYM_MODEL_SKIP_PTR,
            slot: Slot::U8(params.code_models.len() as u8 + 8),
        });
        if params.exports_rva != 0 {
            patches.push(HeaderPatch {
                symbol: stubs::SYM_EXPORT_RVA_PTR,
                slot: Slot::U32(params.exports_rva),
            });
            patches.push(HeaderPatch {
                symbol: stubs::SYM_DATA_DIR_COUNT_PTR,
                slot: Slot::U32(1),
            });
        }
    }
    // A payload that begins with POP EDI went through the call
    // transform; the header's spare NOP becomes the matching PUSH EDI.
    let starts_with_pop_edi = (phase1.raw_size() >= 1 && phase1.data()[0] == 0x5f)
        || (phase1.raw_size() >= 3 && phase1.data()[2] == 0x5f);
    if !params.tiny_header && starts_with_pop_edi {
        patches.push(HeaderPatch { symbol: stubs::SYM_SPARE_NOP_PTR, slot: Slot::U8(0x57) });
    }
    apply_patches(image, &patches)
}
