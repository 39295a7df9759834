mod common;

use common::{entry_hunk, exit_42, test_linker};
use pepack::transform::{detransform_calls, transform_calls};

// Build a code blob full of short calls between its own positions.
fn call_heavy_code(len: usize) -> Vec<u8> {
    let mut code = Vec::with_capacity(len);
    while code.len() + 5 <= len {
        let disp = (code.len() as i32 % 96) - 48;
        code.push(0xe8);
        code.extend_from_slice(&disp.to_le_bytes());
    }
    while code.len() < len {
        code.push(0x90);
    }
    code
}

#[test]
fn test_involution_on_generated_code() {
    for len in [0, 4, 5, 64, 1000] {
        let original = call_heavy_code(len);
        let mut work = original.clone();
        let n = transform_calls(&mut work);
        if len >= 5 {
            assert!(n > 0);
            assert_ne!(work, original);
        }
        assert_eq!(detransform_calls(&mut work), n);
        assert_eq!(work, original);
    }
}

#[test]
fn test_involution_on_noise() {
    // Random bytes contain accidental E8s with arbitrary displacements;
    // the pass must stay reversible regardless.
    let mut state = 99u64;
    let original: Vec<u8> = (0..4096)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (state >> 56) as u8
        })
        .collect();
    let mut work = original.clone();
    let n = transform_calls(&mut work);
    assert_eq!(detransform_calls(&mut work), n);
    assert_eq!(work, original);
}

#[test]
fn test_no_calls_disables_transform_and_warns() {
    // No E8 byte anywhere: the pass must warn, disable itself, and the
    // payload must not begin with the detransformer's POP EDI.
    let mut linker = test_linker();
    linker.add_hunks(entry_hunk(&exit_42()));
    let image = linker.link().unwrap();
    assert_eq!(linker.logger().warning_count(), 1);
    // Without the transform the unpacked image does not start with POP
    // EDI, so the header's spare NOP stays a NOP.
    let header = pepack::stubs::header_4k();
    let nop_offset = header
        .find_symbol(pepack::stubs::SYM_SPARE_NOP_PTR)
        .unwrap()
        .value as usize;
    assert_eq!(image[nop_offset], 0x90);
}

#[test]
fn test_calls_keep_transform_enabled() {
    // Enough short calls for the transform to engage; the header's
    // spare NOP becomes PUSH EDI.
    let mut code = call_heavy_code(60);
    code.extend_from_slice(&exit_42());
    let mut linker = test_linker();
    linker.add_hunks(entry_hunk(&code));
    let image = linker.link().unwrap();
    assert_eq!(linker.logger().warning_count(), 0);
    // The spare NOP slot in the built-in header was rewritten.
    let header = pepack::stubs::header_4k();
    let nop_offset = header
        .find_symbol(pepack::stubs::SYM_SPARE_NOP_PTR)
        .unwrap()
        .value as usize;
    assert_eq!(image[nop_offset], 0x57);
}
