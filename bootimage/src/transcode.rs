use abi::{pool_mask_size, singleton_mask_size, Abi};
use runtime::{Machine, Ref, Type};

use crate::layout::{base_size, target_size};
use crate::typemap::{Kind, TypeMap};

/// Copy one field from build to target representation. Object slots are
/// zeroed — the heap walker patches them with object numbers later. Pad tags
/// emit nothing. Every multi-byte scalar goes through the ABI swap
/// primitives.
pub fn copy_field(build: Abi, target: Abi, src: &[u8], dst: &mut [u8], ty: Type) {
    match ty {
        Type::I8 | Type::U8 => dst[0] = src[0],
        Type::I16 | Type::U16 => target.put16(dst, build.get16(src)),
        Type::I32 | Type::U32 | Type::F32 => target.put32(dst, build.get32(src)),
        Type::I64 | Type::U64 | Type::F64 => target.put64(dst, build.get64(src)),
        Type::IWord | Type::UWord | Type::Word => {
            target.put_word(dst, build.get_word(src))
        }
        Type::Object => dst[..target.word_bytes()].fill(0),
        Type::I64Pad | Type::F64Pad => {}
        Type::None | Type::ArrayMarker => {
            panic!("field with non-copyable tag {ty:?}")
        }
    }
}

fn set_mask_bit(mask: &mut [u8], target: Abi, bit: usize) {
    let bits = target.bits_per_word();
    let word = target.word_bytes();
    let at = (bit / bits) * word;
    let v = target.get_word(&mask[at..]) | 1 << (bit % bits);
    target.put_word(&mut mask[at..], v);
}

/// Transcribe the whole of `p` into `dst` (already sized to the object's
/// target size): every mapped field, the tail array if any, and for
/// singletons and pools the trailing reference/float masks.
pub fn copy_object(
    m: &Machine,
    map: &TypeMap,
    p: Ref,
    dst: &mut [u8],
    build: Abi,
    target: Abi,
) {
    let src = m.heap.data(p);
    let tw = target.word_bytes();

    for field in &map.fields {
        let from = field.build_offset as usize;
        let to = field.target_offset as usize;
        let build_len = field.ty.size(build);
        copy_field(build, target, &src[from..from + build_len], &mut dst[to..], field.ty);
    }

    if map.has_array() {
        let fixed = map.build_fixed_words as usize * build.word_bytes();
        let count = m.heap.get_word(p, fixed - build.word_bytes()) as usize;
        let build_elem = map.build_array_elem_bytes as usize;
        let target_elem = map.target_array_elem_bytes as usize;
        let target_fixed = map.target_fixed_words as usize * tw;
        for i in 0..count {
            let from = fixed + i * build_elem;
            let to = target_fixed + i * target_elem;
            copy_field(
                build,
                target,
                &src[from..from + build_elem],
                &mut dst[to..],
                map.array_elem_type,
            );
        }
        return;
    }

    let words = map.target_fixed_words as usize;
    let bits = target.bits_per_word();
    match map.kind {
        Kind::Normal => {}
        Kind::Singleton => {
            let mask_words = singleton_mask_size(words - 2, bits);
            let mask = &mut dst[words * tw..(words + mask_words) * tw];
            mask.fill(0);
            for field in &map.fields {
                if field.ty == Type::Object {
                    let offset = field.target_offset as usize / tw;
                    set_mask_bit(mask, target, offset);
                }
            }
        }
        Kind::Pool => {
            let float_words = pool_mask_size(words - 2, bits);
            let object_words = singleton_mask_size(words - 2 + float_words, bits);
            let (float_mask, rest) =
                dst[words * tw..].split_at_mut(float_words * tw);
            let object_mask = &mut rest[..object_words * tw];
            float_mask.fill(0);
            object_mask.fill(0);
            for (i, field) in map.fields.iter().enumerate() {
                match field.ty {
                    Type::Object => set_mask_bit(object_mask, target, i),
                    Type::F32 | Type::F64 => set_mask_bit(float_mask, target, i),
                    _ => {}
                }
            }
        }
    }
}

/// Field-wise comparison of the non-object content of `p`'s build image and
/// its emitted target image; only meaningful when build ABI == target ABI.
pub fn nonobjects_equal(
    m: &Machine,
    map: &TypeMap,
    p: Ref,
    dst: &[u8],
    build: Abi,
    target: Abi,
) -> bool {
    let src = m.heap.data(p);

    let one = |ty: Type, from: usize, to: usize| -> bool {
        let n = match ty {
            Type::I8 | Type::U8 => 1,
            Type::I16 | Type::U16 => 2,
            Type::I32 | Type::U32 | Type::F32 => 4,
            Type::I64 | Type::U64 | Type::F64 => 8,
            Type::IWord | Type::UWord | Type::Word => build.word_bytes(),
            _ => return true,
        };
        src[from..from + n] == dst[to..to + n]
    };

    for field in &map.fields {
        if !one(field.ty, field.build_offset as usize, field.target_offset as usize) {
            return false;
        }
    }

    if map.has_array() {
        let fixed = map.build_fixed_words as usize * build.word_bytes();
        let count = m.heap.get_word(p, fixed - build.word_bytes()) as usize;
        let target_fixed = map.target_fixed_words as usize * target.word_bytes();
        for i in 0..count {
            let from = fixed + i * map.build_array_elem_bytes as usize;
            let to = target_fixed + i * map.target_array_elem_bytes as usize;
            if !one(map.array_elem_type, from, to) {
                return false;
            }
        }
    }
    true
}

/// Cross-checks applied when emitting for a native (same-ABI) target. The
/// size identity holds only for mask-free entities: the arena keeps
/// singleton and pool masks outside the host object's data.
pub fn check_native_target(
    m: &Machine,
    map: &TypeMap,
    p: Ref,
    dst: &[u8],
    build: Abi,
    target: Abi,
) {
    if map.kind == Kind::Normal {
        assert_eq!(
            target_size(m, map, p, build, target),
            base_size(m, p),
            "native-target size mismatch for {p:?}"
        );
    }
    assert!(
        nonobjects_equal(m, map, p, dst, build, target),
        "native-target content mismatch for {p:?}"
    );
}
