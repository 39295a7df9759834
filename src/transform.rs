//! Reversible rewrite of near-call displacements.
//!
//! A 32-bit `E8` call displacement that fits in 16 bits is rewritten
//! in place from PC-relative to position-anchored form: short calls to
//! nearby targets then carry small, highly repetitive values and
//! compress far better. The rewrite is undone at run time by the
//! detransformer stub, which needs the number of rewritten calls
//! patched into its `_CallTrans + 2` immediate. When no eligible call
//! exists, the detransformer region is overwritten with `NOP`s and the
//! pass disables itself for subsequent attempts.

use crate::hunk::Hunk;
use crate::log::Logger;

/// Patch points the detransformer stub must define.
pub const SYM_CALLTRANS: &str = "_CallTrans";
pub const SYM_CALLTRANS_SIZE: &str = "_CallTransSize";

#[derive(Debug, Clone)]
pub struct CallTransform {
    enabled: bool,
}

/// Rewrites eligible displacements in `code`; returns how many.
pub fn transform_calls(code: &mut [u8]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i + 4 < code.len() {
        if code[i] == 0xe8 {
            let disp = i32::from_le_bytes(code[i + 1..i + 5].try_into().unwrap());
            if (-0x8000..=0x7fff).contains(&disp) {
                let anchored = (disp.wrapping_add(i as i32 + 1) as i16) as i32;
                code[i + 1..i + 5].copy_from_slice(&anchored.to_le_bytes());
                count += 1;
                i += 4;
            }
        }
        i += 1;
    }
    count
}

/// Undoes `transform_calls`. An anchored displacement always fits in
/// 16 bits and an untouched one never does, so the same scan finds
/// exactly the rewritten calls.
pub fn detransform_calls(code: &mut [u8]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i + 4 < code.len() {
        if code[i] == 0xe8 {
            let stored = i32::from_le_bytes(code[i + 1..i + 5].try_into().unwrap());
            if (-0x8000..=0x7fff).contains(&stored) {
                let disp = (stored.wrapping_sub(i as i32 + 1) as i16) as i32;
                code[i + 1..i + 5].copy_from_slice(&disp.to_le_bytes());
                count += 1;
                i += 4;
            }
        }
        i += 1;
    }
    count
}

impl CallTransform {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Transform used during order measurement: no stub patching, no
    /// logging, no state changes.
    pub fn transform_only(&self, flat: &mut Hunk, split_point: usize) {
        if self.enabled {
            transform_calls(&mut flat.data_mut()[..split_point]);
        }
    }

    /// Applies the transform to the code half of a flat image and
    /// patches the detransformer stub. Returns false when the pass
    /// found nothing to do and disabled itself; the caller should then
    /// relink from the untransformed image.
    pub fn apply(
        &mut self,
        flat: &mut Hunk,
        split_point: usize,
        logger: &mut Logger,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let count = transform_calls(&mut flat.data_mut()[..split_point]);
        if count > 0 {
            if let Some(symbol) = flat.find_symbol(SYM_CALLTRANS) {
                let offset = symbol.value as usize + 2;
                let _ = flat.patch_u32(offset, count as u32);
            }
            logger.info("", &format!("Calls transformed: {}", count));
            true
        } else {
            // Nothing to reverse at run time: blank out the
            // detransformer and stay out of the way from now on.
            if let (Some(start), Some(size)) = (
                flat.find_symbol(SYM_CALLTRANS).map(|s| s.value as usize),
                flat.find_symbol(SYM_CALLTRANS_SIZE).map(|s| s.value as usize),
            ) {
                let end = (start + size).min(flat.raw_size());
                for byte in &mut flat.data_mut()[start..end] {
                    *byte = 0x90;
                }
            }
            logger.warning("", "No calls - call transformation not applied");
            self.disable();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{Logger, MemorySink};

    fn call_at(disp: i32) -> [u8; 5] {
        let mut bytes = [0xe8, 0, 0, 0, 0];
        bytes[1..5].copy_from_slice(&disp.to_le_bytes());
        bytes
    }

    #[test]
    fn test_transform_counts_only_short_calls() {
        let mut code = Vec::new();
        code.extend_from_slice(&call_at(0x10));
        code.extend_from_slice(&call_at(0x12345));
        code.extend_from_slice(&call_at(-0x8000));
        code.push(0xc3);
        let mut copy = code.clone();
        assert_eq!(transform_calls(&mut copy), 2);
        // The out-of-range displacement is untouched.
        assert_eq!(&copy[6..10], &0x12345i32.to_le_bytes());
    }

    #[test]
    fn test_involution() {
        // Assorted shapes: short and long displacements, E8 bytes
        // inside displacements, E8 at the end of the buffer.
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0xe8],
            call_at(0).to_vec(),
            {
                let mut v = Vec::new();
                for i in 0..40 {
                    v.extend_from_slice(&call_at(i * 3 - 60));
                    v.push(0x90);
                }
                v
            },
            {
                // A displacement whose bytes contain E8.
                let mut v = call_at(0x7fe8).to_vec();
                v.extend_from_slice(&call_at(-0x10));
                v.extend_from_slice(&[0xe8, 0xe8, 0xe8, 0xe8, 0xe8]);
                v
            },
            {
                // Long calls interleaved with short ones.
                let mut v = Vec::new();
                v.extend_from_slice(&call_at(0x123456));
                v.extend_from_slice(&call_at(5));
                v.extend_from_slice(&call_at(-0x700000));
                v.extend_from_slice(&call_at(-5));
                v
            },
        ];
        for original in cases {
            let mut work = original.clone();
            let transformed = transform_calls(&mut work);
            let detransformed = detransform_calls(&mut work);
            assert_eq!(work, original, "{:02x?}", original);
            assert_eq!(transformed, detransformed);
        }
    }

    #[test]
    fn test_transformed_values_are_small() {
        // Calls between nearby positions end with a zero or sign-filled
        // high half, which is the point of the exercise.
        let mut code = Vec::new();
        for _ in 0..8 {
            code.extend_from_slice(&call_at(0x40));
            code.extend_from_slice(&[0x90; 3]);
        }
        transform_calls(&mut code);
        for chunk in code.chunks(8) {
            let high = i16::from_le_bytes(chunk[3..5].try_into().unwrap());
            assert!(high == 0 || high == -1, "{:02x?}", chunk);
        }
    }

    #[test]
    fn test_apply_disables_without_calls() {
        let mut transform = CallTransform::new(true);
        let mut logger = Logger::new(Box::new(MemorySink::default()));
        let mut flat = Hunk::new("flat", crate::hunk::HUNK_IS_CODE, 0, vec![0x90; 16], 0);
        flat.add_symbol(crate::hunk::Symbol::new(SYM_CALLTRANS, 4, crate::hunk::SYMBOL_IS_RELOCATABLE));
        flat.add_symbol(crate::hunk::Symbol::new(SYM_CALLTRANS_SIZE, 8, 0));
        flat.data_mut()[4..12].copy_from_slice(&[0x5f, 0xb9, 0, 0, 0, 0, 0xaa, 0xbb]);
        let applied = transform.apply(&mut flat, 16, &mut logger);
        assert!(!applied);
        assert!(!transform.is_enabled());
        assert_eq!(&flat.data()[4..12], &[0x90; 8]);
        assert_eq!(logger.warning_count(), 1);
    }

    #[test]
    fn test_apply_patches_count() {
        let mut transform = CallTransform::new(true);
        let mut logger = Logger::new(Box::new(MemorySink::default()));
        let mut data = vec![0x5f, 0xb9, 0, 0, 0, 0];
        data.extend_from_slice(&call_at(2));
        data.extend_from_slice(&call_at(-2));
        let mut flat = Hunk::new("flat", crate::hunk::HUNK_IS_CODE, 0, data, 0);
        flat.add_symbol(crate::hunk::Symbol::new(SYM_CALLTRANS, 0, crate::hunk::SYMBOL_IS_RELOCATABLE));
        flat.add_symbol(crate::hunk::Symbol::new(SYM_CALLTRANS_SIZE, 6, 0));
        let split = flat.raw_size();
        assert!(transform.apply(&mut flat, split, &mut logger));
        assert_eq!(flat.read_u32(2), 2);
        assert!(transform.is_enabled());
    }
}
