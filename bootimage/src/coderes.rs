use abi::Abi;
use runtime::{
    AccessFlags, DeferredAddress, DeferredCall, HeapConstant, HeapWalker,
    Machine, Thunks,
};

use crate::bitmap::Bitmap;

fn patch_word(code: &mut [u8], target: Abi, site: u32, value: u64) {
    let at = site as usize;
    target.put_word(&mut code[at..at + target.word_bytes()], value);
}

/// Method-call pass: resolve each deferred call to an absolute address —
/// the native thunk for native methods, the method's compiled entry
/// otherwise — and patch its immediate. Call immediates are plain addresses;
/// they carry no relocation bit.
pub fn resolve_calls(
    m: &Machine,
    calls: &[DeferredCall],
    thunks: &Thunks,
    code: &mut [u8],
    code_base: u64,
    target: Abi,
) {
    for call in calls {
        let address = if m.method_flags(call.method).contains(AccessFlags::NATIVE) {
            code_base + thunks.native_start as u64
        } else {
            let code_obj = m.method_code(call.method);
            assert!(!code_obj.is_null(), "call to uncompiled method");
            m.code_compiled(code_obj)
        };
        patch_word(code, target, call.site, address);
    }
}

/// Address pass: rebase each intra-code address to a code-segment offset,
/// tag flat constants, and mark the immediate in the code bitmap.
pub fn resolve_addresses(
    addresses: &[DeferredAddress],
    code: &mut [u8],
    code_map: &mut Bitmap,
    code_base: u64,
    target: Abi,
) {
    for a in addresses {
        let value = code_base + a.basis as u64;
        assert!(value >= code_base, "address below the code segment");
        let mut offset = value - code_base;
        if a.flat {
            offset |= target.boot_flat_constant();
        }
        patch_word(code, target, a.site, offset);
        code_map.mark(a.site as usize);
    }
}

/// Heap-constant pass: rewrite every code immediate holding a heap reference
/// to the referent's object number, tagged as a boot heap offset, and mark
/// the code bitmap.
pub fn resolve_heap_constants(
    constants: &[HeapConstant],
    walker: &HeapWalker,
    code: &mut [u8],
    code_map: &mut Bitmap,
    target: Abi,
) {
    for constant in constants {
        let number = walker.number(constant.value);
        assert!(
            number > 0,
            "heap constant {:?} was never emitted",
            constant.value
        );
        for site in &constant.sites {
            let mut value = number as u64 | target.boot_heap_offset();
            if site.flat {
                value |= target.boot_flat_constant();
            }
            patch_word(code, target, site.location, value);
            code_map.mark(site.location as usize);
        }
    }
}
