//! Classification of existing output files.
//!
//! Recompression starts by recovering the coding parameters from the
//! finished executable itself: the header kind and linker version from
//! the DOS header, then the model lists, hash-table size and layout
//! constants from documented byte patterns in the depacker. This
//! module is that parsing half; actually re-running the depacker to
//! obtain the unpacked bytes requires process tracing and is left to
//! platform-specific callers.

use crate::error::Error;
use crate::modellist::{CompressionTier, ModelList1k, ModelList4k};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// PE header at offset 4.
    Modern,
    /// PE header at offset 12, separate depacker.
    Compatibility,
    /// Single-model header with the `BT [imm32]` marker.
    Tiny,
}

/// Everything recoverable from a compressed executable without running
/// it.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub kind: HeaderKind,
    /// Two-digit version, e.g. 22 for "2.2".
    pub version: u32,
    pub subsystem: u8,
    pub large_address_aware: bool,
    pub saturate: bool,
    pub compression_tier: Option<CompressionTier>,
    pub virtual_size: u32,
    pub hashtable_size: Option<u32>,
    pub models_code: Option<ModelList4k>,
    pub models_data: Option<ModelList4k>,
    pub models_1k: Option<ModelList1k>,
    pub raw_size: u32,
    pub split_point: u32,
    pub exports_rva: u32,
    pub compressed_data_rva: u32,
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
}

const SATURATE_CODE: [u8; 5] = [0x75, 0x03, 0xfe, 0x0c, 0x1f];

/// Parses a compressed executable. Anything that does not carry our
/// version digits and one of the known header shapes is rejected as
/// `NotCompressedExecutable`.
pub fn inspect(data: &[u8]) -> Result<ImageInfo, Error> {
    if data.len() < 200 {
        return Err(Error::NotCompressedExecutable);
    }
    let pe_offset = read_u32(data, 0x3c).ok_or(Error::NotCompressedExecutable)? as usize;
    let (kind, major, minor) = match pe_offset {
        4 => {
            let tiny = data[2] >= b'2' && data[0xc..0xf] == [0x0f, 0xa3, 0x2d];
            (
                if tiny { HeaderKind::Tiny } else { HeaderKind::Modern },
                data[2],
                data[3],
            )
        }
        12 => (HeaderKind::Compatibility, data[38], data[39]),
        _ => return Err(Error::NotCompressedExecutable),
    };
    if !major.is_ascii_digit() || !minor.is_ascii_digit() {
        return Err(Error::NotCompressedExecutable);
    }
    let version = u32::from(major - b'0') * 10 + u32::from(minor - b'0');

    let virtual_size = read_u32(data, pe_offset + 0x50)
        .ok_or(Error::NotCompressedExecutable)?
        .wrapping_sub(0x20000);
    let subsystem = data[pe_offset + 0x5c];
    let characteristics = read_u16(data, pe_offset + 0x16).unwrap_or(0);
    let large_address_aware = characteristics & 0x0020 != 0;
    let saturate = data.windows(SATURATE_CODE.len()).any(|w| w == SATURATE_CODE);

    // Scan the header region for the depacker's marker instructions.
    let mut hashtable_size = None;
    let mut models_address = None;
    let mut models_1k = ModelList1k { modelmask: 0, boost: 0, baseprob0: 0, baseprob1: 0 };
    let mut raw_size_offset = None;
    let mut compressed_data_rva = None;
    let scan_end = data.len().min(0x200).saturating_sub(16);
    for i in 0..scan_end {
        match kind {
            HeaderKind::Tiny => {
                // CMP DI, imm16 marks the depack end position.
                if data[i] == 0x66 && data[i + 1] == 0x81 && data[i + 2] == 0xff {
                    raw_size_offset = Some(i + 3);
                }
                if version <= 21 {
                    // MOV ECX,0; POP ECX; PUSH imm8 ... layout.
                    if data[i] == 0xb9
                        && data[i + 1..i + 5] == [0, 0, 0, 0]
                        && data[i + 5] == 0x59
                        && data[i + 6] == 0x6a
                    {
                        models_1k.baseprob0 = u32::from(data[i + 7]);
                        models_1k.baseprob1 = u32::from(data[i + 9]);
                        models_1k.modelmask = read_u32(data, i + 11).unwrap_or(0);
                    }
                } else {
                    // PUSH imm8; CMP EAX,0; PUSH imm8 ... layout.
                    if data[i] == 0x6a
                        && data[i + 2] == 0x3d
                        && data[i + 3..i + 7] == [0, 0, 0, 0]
                        && data[i + 7] == 0x6a
                    {
                        models_1k.baseprob0 = u32::from(data[i + 1]);
                        models_1k.baseprob1 = u32::from(data[i + 8]);
                        models_1k.modelmask = read_u32(data, i + 10).unwrap_or(0);
                    }
                }
                // JG; MOV CL, boost; MOV ESI, ESP.
                if data[i] == 0x7f && data[i + 2] == 0xb1 && data[i + 4] == 0x89 && data[i + 5] == 0xe6
                {
                    models_1k.boost = u32::from(data[i + 3]);
                }
                if data[i..i + 3] == [0x0f, 0xa3, 0x2d] && compressed_data_rva.is_none() {
                    compressed_data_rva = read_u32(data, i + 3);
                }
            }
            _ => {
                // MOV EDI, table; MOV ECX, entry count.
                if data[i] == 0xbf && data[i + 5] == 0xb9 && hashtable_size.is_none() {
                    hashtable_size = read_u32(data, i + 6).map(|e| e * 2);
                }
                // MOV ESI, models: the descriptor lives in the first
                // 64 KiB above the image base.
                if data[i] == 0xbe
                    && data[i + 3] == 0x40
                    && data[i + 4] == 0x00
                    && models_address.is_none()
                {
                    models_address = read_u32(data, i + 1);
                }
            }
        }
    }

    let mut info = ImageInfo {
        kind,
        version,
        subsystem,
        large_address_aware,
        saturate,
        compression_tier: None,
        virtual_size,
        hashtable_size: None,
        models_code: None,
        models_data: None,
        models_1k: None,
        raw_size: 0,
        split_point: 0,
        exports_rva: 0,
        compressed_data_rva: 0,
    };

    if kind == HeaderKind::Tiny {
        let raw_size_offset = match (raw_size_offset, compressed_data_rva) {
            (Some(offset), Some(rva)) => {
                info.compressed_data_rva = rva;
                offset
            }
            _ => return Err(Error::NotCompressedExecutable),
        };
        info.raw_size = u32::from(read_u16(data, raw_size_offset).unwrap_or(0));
        info.split_point = info.raw_size;
        info.models_1k = Some(models_1k);
    } else {
        let (hashtable_size, models_address) = match (hashtable_size, models_address) {
            (Some(h), Some(m)) => (h, m),
            _ => return Err(Error::NotCompressedExecutable),
        };
        info.hashtable_size = Some(hashtable_size);
        let models_offset = models_address.wrapping_sub(crate::IMAGE_BASE) as usize;
        // First descriptor: negated end address, weight mask, masks.
        let code_weightmask =
            read_u32(data, models_offset + 4).ok_or(Error::NotCompressedExecutable)?;
        let code_end = read_u32(data, models_offset).ok_or(Error::NotCompressedExecutable)?;
        let split_point = code_end.wrapping_neg().wrapping_sub(crate::CODE_BASE);
        let code_count = count_models(code_weightmask);
        let code_masks = data
            .get(models_offset + 8..models_offset + 8 + code_count)
            .ok_or(Error::NotCompressedExecutable)?;
        let models_code = ModelList4k::from_masks_and_weight_mask(code_masks, code_weightmask);
        let model_skip = 8 + models_code.len();
        let data_weightmask = read_u32(data, models_offset + model_skip + 4)
            .ok_or(Error::NotCompressedExecutable)?;
        let data_end = read_u32(data, models_offset + model_skip)
            .ok_or(Error::NotCompressedExecutable)?;
        let raw_size = data_end.wrapping_neg().wrapping_sub(crate::CODE_BASE);
        let data_count = count_models(data_weightmask);
        let data_masks = data
            .get(models_offset + model_skip + 8..models_offset + model_skip + 8 + data_count)
            .ok_or(Error::NotCompressedExecutable)?;
        let models_data = ModelList4k::from_masks_and_weight_mask(data_masks, data_weightmask);
        info.split_point = split_point;
        info.raw_size = raw_size;
        info.compression_tier = Some(models_code.detect_compression_tier());
        info.models_code = Some(models_code);
        info.models_data = Some(models_data);
        if kind == HeaderKind::Modern && major >= b'2' {
            info.exports_rva = read_u32(data, pe_offset + 0x78).unwrap_or(0);
        }
    }
    Ok(info)
}

/// Number of models a weight mask describes: its zero bits up to the
/// terminating run of ones. The encoding always ends on a model (a
/// zero bit), so an unbroken run of ones reaching bit 31 can only be
/// the terminator.
fn count_models(weightmask: u32) -> usize {
    let mut count = 0;
    for pos in 0..32 {
        let rest = weightmask >> pos;
        if rest != 0 && rest == u32::MAX >> pos {
            break;
        }
        if weightmask & (1 << pos) == 0 {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_short_rejected() {
        match inspect(&[0u8; 100]) {
            Err(Error::NotCompressedExecutable) => (),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_bad_pe_offset_rejected() {
        let mut data = vec![0u8; 0x400];
        data[0x3c] = 0x80;
        match inspect(&data) {
            Err(Error::NotCompressedExecutable) => (),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_count_models() {
        // Three models at weight zero, then terminator ones.
        let weightmask = !0u32 << 3;
        assert_eq!(count_models(weightmask), 3);
        // weight raise, model, raise, model: 0b1010 pattern low bits.
        let weightmask = (!0u32 << 4) | 0b0101;
        assert_eq!(count_models(weightmask), 2);
    }
}
