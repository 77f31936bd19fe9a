use abi::{
    ceiling, Abi, FIXED_MARK, FIXIE_AGE_OFFSET, FIXIE_HAS_MASK_OFFSET,
    FIXIE_SIZE_OFFSET, FIXIE_TENURE_THRESHOLD,
};
use runtime::{Heap, HeapVisitor, Machine, Ref, VmType};

use crate::bitmap::Bitmap;
use crate::layout::{target_offset, target_size};
use crate::transcode::{check_native_target, copy_object};
use crate::typemap::TypeMaps;

/// The target-format heap under construction: a byte buffer addressed in
/// target words, append-only, with a hard capacity.
pub struct HeapBuffer {
    target: Abi,
    bytes: Vec<u8>,
    capacity_words: usize,
    position: usize,
}

impl HeapBuffer {
    pub fn new(target: Abi, capacity_bytes: usize) -> Self {
        Self {
            target,
            bytes: Vec::new(),
            capacity_words: capacity_bytes / target.word_bytes(),
            position: 0,
        }
    }

    /// Words emitted so far.
    #[inline(always)]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Claim `words` words at the current position.
    pub fn advance(&mut self, words: usize) {
        self.position += words;
        self.grow_to(self.position);
    }

    #[inline(always)]
    pub fn capacity_words(&self) -> usize {
        self.capacity_words
    }

    fn grow_to(&mut self, word: usize) {
        let need = word * self.target.word_bytes();
        if self.bytes.len() < need {
            self.bytes.resize(need, 0);
        }
    }

    pub fn get_word(&self, index: usize) -> u64 {
        let at = index * self.target.word_bytes();
        if at + self.target.word_bytes() > self.bytes.len() {
            return 0;
        }
        self.target.get_word(&self.bytes[at..])
    }

    pub fn set_word(&mut self, index: usize, v: u64) {
        self.grow_to(index + 1);
        let at = index * self.target.word_bytes();
        self.target.put_word(&mut self.bytes[at..], v);
    }

    pub fn or_word(&mut self, index: usize, bits: u64) {
        let v = self.get_word(index) | bits;
        self.set_word(index, v);
    }

    /// Mutable byte view of `[word, word + byte_len)`, growing as needed.
    pub fn slice_mut(&mut self, word: usize, byte_len: usize) -> &mut [u8] {
        let at = word * self.target.word_bytes();
        self.grow_to(word + ceiling(byte_len, self.target.word_bytes()));
        &mut self.bytes[at..at + byte_len]
    }

    /// The emitted heap image: `position` words of bytes.
    pub fn bytes(&self) -> &[u8] {
        let len = self.position * self.target.word_bytes();
        &self.bytes[..len.min(self.bytes.len())]
    }
}

/// The heap-walk visitor: assigns numbers, emits objects into the heap
/// buffer (plain or fixed), marks pointer slots in the heap bitmap, and
/// back-patches reference edges as the walker reports them.
pub struct ImageVisitor<'a> {
    m: &'a Machine,
    maps: &'a TypeMaps,
    build: Abi,
    target: Abi,
    pub heap: HeapBuffer,
    pub heap_map: Bitmap,
    current_object: Ref,
    current_number: u32,
    current_offset: u32,
    debug_native_target: bool,
}

impl<'a> ImageVisitor<'a> {
    pub fn new(
        m: &'a Machine,
        maps: &'a TypeMaps,
        target: Abi,
        heap_capacity: usize,
        debug_native_target: bool,
    ) -> Self {
        Self {
            m,
            maps,
            build: m.build_abi(),
            target,
            heap: HeapBuffer::new(target, heap_capacity),
            heap_map: Bitmap::new(target),
            current_object: Ref::NULL,
            current_number: 0,
            current_offset: 0,
            debug_native_target,
        }
    }

    /// An object is emitted fixed iff the edge reaching it leaves a class's
    /// static-table slot, or it is a system class loader. Fixed objects stay
    /// mutable at runtime, so they carry their own dirty-reference mask.
    fn is_fixed(&self, p: Ref) -> bool {
        (!self.current_object.is_null()
            && self.m.is_instance(self.current_object, VmType::Class)
            && self.current_offset * self.build.word_bytes() as u32
                == self.m.class_static_table_offset())
            || self.m.is_instance(p, VmType::SystemClassLoader)
    }

    /// Patch the slot the current edge left from with `number`, preserving
    /// any pre-seeded low tag bits by parking them in the top of the word.
    fn patch(&mut self, number: u32) {
        if self.current_object.is_null() {
            return;
        }

        let map = self.maps.get(self.m, self.current_object);
        let build_off = self.current_offset as usize * self.build.word_bytes();
        let toff = target_offset(map, self.build, self.target, build_off);
        if self.debug_native_target {
            assert_eq!(toff, build_off, "native-target offset mismatch");
        }

        let slot = self.current_number as usize - 1 + toff / self.target.word_bytes();
        let mark = self.heap.get_word(slot) & !self.target.pointer_mask();
        let value = number as u64 | mark << self.target.boot_shift();
        if value != 0 {
            self.heap_map.mark(slot);
        }
        self.heap.set_word(slot, value);
    }

    fn emit_plain(&mut self, p: Ref) -> u32 {
        let map = self.maps.get(self.m, p);
        let size = target_size(self.m, map, p, self.build, self.target);
        let position = self.heap.position;
        assert!(
            position + size < self.heap.capacity_words,
            "heap capacity exceeded at {position} words"
        );

        let tw = self.target.word_bytes();
        let dst = self.heap.slice_mut(position, size * tw);
        copy_object(self.m, map, p, dst, self.build, self.target);
        if self.debug_native_target {
            let dst = &self.heap.slice_mut(position, size * tw)[..];
            check_native_target(self.m, map, p, dst, self.build, self.target);
        }

        self.heap.advance(size);
        position as u32 + 1
    }

    fn emit_fixed(&mut self, p: Ref) -> u32 {
        let map = self.maps.get(self.m, p);
        let size = target_size(self.m, map, p, self.build, self.target);
        let tw = self.target.word_bytes();
        let fixie_words = self.target.fixie_size_words();
        let mask_words = ceiling(size, tw);
        let total = fixie_words + size + mask_words;

        let position = self.heap.position;
        assert!(
            position + total < self.heap.capacity_words,
            "heap capacity exceeded at {position} words"
        );

        let header = self.heap.slice_mut(position, self.target.fixie_size_bytes());
        header.fill(0);
        header[FIXIE_AGE_OFFSET] = FIXIE_TENURE_THRESHOLD + 1;
        header[FIXIE_HAS_MASK_OFFSET] = 1;
        let size_bytes = (size * tw) as u32;
        self.target.put32(&mut header[FIXIE_SIZE_OFFSET..], size_bytes);

        let body = position + fixie_words;
        let dst = self.heap.slice_mut(body, size * tw);
        copy_object(self.m, map, p, dst, self.build, self.target);
        if self.debug_native_target {
            let dst = &self.heap.slice_mut(body, size * tw)[..];
            check_native_target(self.m, map, p, dst, self.build, self.target);
        }
        self.heap.or_word(body, FIXED_MARK);

        // Zero trailing mask words; the runtime fills them as references
        // dirty.
        let mask = self.heap.slice_mut(body + size, mask_words * tw);
        mask.fill(0);

        self.heap.advance(total);
        body as u32 + 1
    }
}

impl HeapVisitor for ImageVisitor<'_> {
    fn root(&mut self) {
        self.current_object = Ref::NULL;
    }

    fn visit_new(&mut self, _heap: &Heap, p: Ref) -> u32 {
        let number = if self.is_fixed(p) {
            self.emit_fixed(p)
        } else {
            self.emit_plain(p)
        };
        self.patch(number);
        number
    }

    fn visit_old(&mut self, _heap: &Heap, _p: Ref, number: u32) {
        self.patch(number);
    }

    fn push(&mut self, _heap: &Heap, parent: Ref, parent_number: u32, word_offset: u32) {
        self.current_object = parent;
        self.current_number = parent_number;
        self.current_offset = word_offset;
    }

    fn pop(&mut self) {
        self.current_object = Ref::NULL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typemap::{class_maps, descriptor_map};
    use abi::{Endian, WordSize};
    use runtime::testutil::ClassBuilder;
    use runtime::{AccessFlags, HeapWalker};

    const B64: Abi = Abi { word: WordSize::W64, endian: Endian::Little };

    fn install_descriptor_maps(m: &Machine, maps: &mut TypeMaps, target: Abi) {
        for ty in VmType::ALL {
            let map = descriptor_map(ty.descriptor(), m.build_abi(), target);
            maps.insert(m.type_class(ty), map);
        }
    }

    fn walk_roots(
        m: &Machine,
        maps: &TypeMaps,
        roots: &[Ref],
    ) -> (HeapWalker, HeapBuffer, Bitmap) {
        let mut walker = HeapWalker::new();
        let mut visitor = ImageVisitor::new(m, maps, B64, 1 << 20, false);
        for &r in roots {
            walker.visit_root(&m.heap, &mut visitor, r);
        }
        (walker, visitor.heap, visitor.heap_map)
    }

    #[test]
    fn plain_objects_pack_contiguously() {
        let mut m = Machine::bootstrap(B64);
        let a = m.make_byte_array(b"ab");
        let b = m.make_byte_array(b"cd");
        let pair = m.make_triple(a, b, Ref::NULL);
        let mut maps = TypeMaps::new();
        install_descriptor_maps(&m, &mut maps, B64);

        let (walker, heap, map) = walk_roots(&m, &maps, &[pair]);
        // Numbers are 1-based word positions.
        assert_eq!(walker.number(pair), 1);
        assert!(walker.number(a) > 1);
        // Every marked bitmap slot holds a nonzero word.
        for i in 0..heap.position() {
            if map.is_marked(i) {
                assert_ne!(heap.get_word(i), 0, "slot {i}");
            }
        }
        // The triple's first slot (word 1, after the class word) was patched
        // with a's number.
        let first_slot = walker.number(pair) as usize - 1 + 1;
        assert_eq!(heap.get_word(first_slot), walker.number(a) as u64);
        assert!(map.is_marked(first_slot));
    }

    #[test]
    fn class_slot_of_every_object_is_patched() {
        let mut m = Machine::bootstrap(B64);
        let a = m.make_byte_array(b"x");
        let mut maps = TypeMaps::new();
        install_descriptor_maps(&m, &mut maps, B64);

        let (walker, heap, _) = walk_roots(&m, &maps, &[a]);
        let byte_array_class = m.type_class(VmType::ByteArray);
        let slot = walker.number(a) as usize - 1;
        assert_eq!(heap.get_word(slot), walker.number(byte_array_class) as u64);
    }

    #[test]
    fn static_tables_are_emitted_fixed() {
        let mut m = Machine::bootstrap(B64);
        let mut cb = ClassBuilder::new("F");
        let hello = cb.add_string("hi");
        let bytes = cb
            .field(AccessFlags::STATIC, "s", "Ljava/lang/String;")
            .field_with_constant(
                AccessFlags::STATIC,
                "t",
                "Ljava/lang/String;",
                hello,
            )
            .build();
        let class = m.resolve_system_class("F", &bytes).expect("resolve");
        let table = m.class_static_table(class);

        let mut maps = TypeMaps::new();
        install_descriptor_maps(&m, &mut maps, B64);
        let (member, statics) = class_maps(&m, class, B64, B64);
        maps.insert(class, member);
        let (st, smap) = statics.expect("statics");
        let fixed_size = target_size(&m, &smap, st, B64, B64);
        maps.insert(st, smap);
        let pool_map = crate::typemap::pool_type_map(&bytes, B64, B64)
            .expect("scan")
            .expect("pool");
        maps.insert(*m.pool_map.get(&class).expect("pool"), pool_map);

        let (walker, heap, bitmap) = walk_roots(&m, &maps, &[class]);

        let number = walker.number(table) as usize;
        assert!(number > 0);
        // The body's first word carries the fixed mark folded into the class
        // patch: low bit relocated to the top two bits of the word.
        let class_slot = heap.get_word(number - 1);
        let singleton_class = walker.number(m.type_class(VmType::Singleton));
        assert_eq!(class_slot & B64.pointer_mask() >> 2, singleton_class as u64);
        assert_eq!(class_slot >> B64.boot_shift(), FIXED_MARK);
        assert!(bitmap.is_marked(number - 1));

        // The fixie header sits two reserved words plus 8 bytes before the
        // body and records the size in target bytes.
        let header_word = number - 1 - B64.fixie_size_words();
        let header = heap.get_word(header_word);
        let age = (header & 0xFF) as u8;
        assert_eq!(age, FIXIE_TENURE_THRESHOLD + 1);
        let has_mask = (header >> 8 & 0xFF) as u8;
        assert_eq!(has_mask, 1);
        let size_field = (header >> 32) as u32;
        assert_eq!(size_field, (fixed_size * 8) as u32);

        // The interned string static was patched and marked.
        let hello_obj = *m.intern_table.get("hi").expect("interned");
        let t_slot = number - 1 + 3;
        assert_eq!(heap.get_word(t_slot), walker.number(hello_obj) as u64);
        assert!(bitmap.is_marked(t_slot));
        // The null static slot stays clear.
        let s_slot = number - 1 + 2;
        assert_eq!(heap.get_word(s_slot), 0);
        assert!(!bitmap.is_marked(s_slot));
    }

    #[test]
    fn system_class_loaders_are_fixed() {
        let mut m = Machine::bootstrap(B64);
        m.seal();
        let mut maps = TypeMaps::new();
        install_descriptor_maps(&m, &mut maps, B64);

        let mut walker = HeapWalker::new();
        let mut visitor = ImageVisitor::new(&m, &maps, B64, 1 << 22, false);
        let boot = m.boot_loader;
        walker.visit_root(&m.heap, &mut visitor, boot);

        let number = walker.number(boot) as usize;
        let body = visitor.heap.get_word(number - 1);
        assert_eq!(body >> B64.boot_shift(), FIXED_MARK);
    }

    #[test]
    fn plain_objects_are_not_fixed() {
        let mut m = Machine::bootstrap(B64);
        let a = m.make_byte_array(b"plain");
        let mut maps = TypeMaps::new();
        install_descriptor_maps(&m, &mut maps, B64);
        let (walker, heap, _) = walk_roots(&m, &maps, &[a]);
        // A plain object's class slot has no relocated mark bits.
        let slot = walker.number(a) as usize - 1;
        assert_eq!(heap.get_word(slot) >> B64.boot_shift(), 0);
    }
}
