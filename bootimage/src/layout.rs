use abi::{ceiling, pool_mask_size, singleton_mask_size, Abi};
use runtime::{Machine, Ref};

use crate::typemap::{Kind, TypeMap};

/// Translate a build byte offset within `map`'s entity to the target byte
/// offset. Offsets past the fixed prefix index into the tail array.
pub fn target_offset(map: &TypeMap, build: Abi, target: Abi, build_off: usize) -> usize {
    let prefix = map.build_fixed_words as usize * build.word_bytes();
    if map.has_array() && build_off >= prefix {
        let index = (build_off - prefix) / map.build_array_elem_bytes as usize;
        map.target_fixed_words as usize * target.word_bytes()
            + index * map.target_array_elem_bytes as usize
    } else {
        map.target_fixed_offsets[build_off] as usize
    }
}

/// Target size of the live object `p` under `map`, in target words. Arrays
/// read their element count from the last word of the fixed prefix;
/// singletons and pools add their trailing masks.
pub fn target_size(m: &Machine, map: &TypeMap, p: Ref, build: Abi, target: Abi) -> usize {
    let words = map.target_fixed_words as usize;
    let bits = target.bits_per_word();

    if map.has_array() {
        let length_off = (map.build_fixed_words as usize - 1) * build.word_bytes();
        let count = m.heap.get_word(p, length_off) as usize;
        return words
            + ceiling(
                map.target_array_elem_bytes as usize * count,
                target.word_bytes(),
            );
    }

    match map.kind {
        Kind::Normal => words,
        Kind::Singleton => words + singleton_mask_size(words - 2, bits),
        Kind::Pool => {
            let mask = pool_mask_size(words - 2, bits);
            words + mask + singleton_mask_size(words - 2 + mask, bits)
        }
    }
}

/// Size of `p`'s build image, in build words.
pub fn base_size(m: &Machine, p: Ref) -> usize {
    m.heap.size_in_words(p)
}
