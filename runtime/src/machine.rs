use abi::{ceiling, pad, Abi};
use indexmap::IndexMap;
use log::debug;

use crate::classfile::{self, AccessFlags, ClassFileError, FieldCode, ParsedClass, PoolEntry};
use crate::heap::{Heap, Ref};
use crate::types::{
    class_field, code_field, field_field, layout, loader_field, method_field,
    string_field, triple_field, Layout, VmType,
};

/// Set in the flags word of the nine synthetic primitive classes.
pub const PRIMITIVE_FLAG: u64 = 1 << 16;

pub const PRIMITIVE_NAMES: [&str; 9] = [
    "void", "boolean", "byte", "short", "char", "int", "float", "long",
    "double",
];

/// A `ConstantValue` initializer, resolved against the class's parsed pool
/// before the static table exists.
enum StaticInit {
    Raw4([u8; 4]),
    Raw8([u8; 8]),
    Str(String),
}

impl StaticInit {
    fn resolve(
        parsed: &ParsedClass,
        index: u16,
        build: Abi,
    ) -> Result<Self, ClassFileError> {
        Ok(match parsed.entry(index)? {
            PoolEntry::Integer(v) => {
                let mut b = [0u8; 4];
                build.put32(&mut b, *v as u32);
                StaticInit::Raw4(b)
            }
            PoolEntry::Float(v) => {
                let mut b = [0u8; 4];
                build.put32(&mut b, v.to_bits());
                StaticInit::Raw4(b)
            }
            PoolEntry::Long(v) => {
                let mut b = [0u8; 8];
                build.put64(&mut b, *v as u64);
                StaticInit::Raw8(b)
            }
            PoolEntry::Double(v) => {
                let mut b = [0u8; 8];
                build.put64(&mut b, v.to_bits());
                StaticInit::Raw8(b)
            }
            PoolEntry::StringRef(idx) => {
                StaticInit::Str(parsed.utf8(*idx)?.to_string())
            }
            _ => return Err(ClassFileError::BadPoolIndex(index)),
        })
    }
}

/// The VM context: the build-layout heap plus everything the writer consumes
/// through the collaborator interface. Construction and teardown are
/// explicit; there are no process-wide singletons.
pub struct Machine {
    pub heap: Heap,
    layouts: Vec<Layout>,
    type_classes: [Ref; VmType::COUNT],
    /// Array object holding the internal type classes.
    pub types: Ref,
    pub boot_loader: Ref,
    pub app_loader: Ref,
    /// Class dictionaries, kept host-side while classes load and sealed into
    /// heap arrays before the walk. Insertion order is emission order.
    pub boot_dictionary: IndexMap<String, Ref>,
    pub app_dictionary: IndexMap<String, Ref>,
    /// Interned strings, in intern order.
    pub intern_table: IndexMap<String, Ref>,
    /// Class object → constant-pool singleton.
    pub pool_map: IndexMap<Ref, Ref>,
}

impl Machine {
    pub fn bootstrap(build: Abi) -> Self {
        let layouts: Vec<Layout> = VmType::ALL
            .iter()
            .map(|ty| layout(ty.descriptor(), build))
            .collect();

        let mut heap = Heap::new(build);

        // The metaclass is its own class, so allocate every type class first
        // and tie the knot afterwards.
        let class_layout = layouts[VmType::Class as usize].clone();
        let mut type_classes = [Ref::NULL; VmType::COUNT];
        for ty in VmType::ALL {
            type_classes[ty as usize] = heap.alloc(
                Ref::NULL,
                class_layout.size_bytes as usize,
                class_layout.ref_offsets.clone(),
            );
        }
        for ty in VmType::ALL {
            heap.set_class(type_classes[ty as usize], type_classes[VmType::Class as usize]);
        }

        let mut m = Machine {
            heap,
            layouts,
            type_classes,
            types: Ref::NULL,
            boot_loader: Ref::NULL,
            app_loader: Ref::NULL,
            boot_dictionary: IndexMap::new(),
            app_dictionary: IndexMap::new(),
            intern_table: IndexMap::new(),
            pool_map: IndexMap::new(),
        };

        for ty in VmType::ALL {
            let c = m.type_classes[ty as usize];
            let name = m.make_byte_array(ty.name().as_bytes());
            m.put_field_ref(c, VmType::Class, class_field::NAME, name);
            let size = m.layouts[ty as usize].size_bytes as u64;
            m.put_field_word(c, VmType::Class, class_field::FIXED_SIZE, size);
        }

        m.boot_loader = m.make_internal(VmType::SystemClassLoader);
        m.app_loader = m.make_internal(VmType::SystemClassLoader);
        let boot = m.boot_loader;
        m.put_field_ref(m.app_loader, VmType::SystemClassLoader, loader_field::PARENT, boot);
        for ty in VmType::ALL {
            let c = m.type_classes[ty as usize];
            m.put_field_ref(c, VmType::Class, class_field::LOADER, boot);
        }

        let type_classes = m.type_classes;
        m.types = m.make_array(&type_classes);

        // The primitive classes are named at build time so the runtime never
        // has to update an immutable reference lazily.
        let word = m.heap.abi().word_bytes();
        for name in PRIMITIVE_NAMES {
            let c = m.make_class(
                name,
                boot,
                Ref::NULL,
                Ref::NULL,
                Ref::NULL,
                PRIMITIVE_FLAG,
                word,
            );
            m.boot_dictionary.insert(name.to_string(), c);
        }

        m
    }

    #[inline(always)]
    pub fn build_abi(&self) -> Abi {
        self.heap.abi()
    }

    #[inline]
    pub fn layout(&self, ty: VmType) -> &Layout {
        &self.layouts[ty as usize]
    }

    #[inline]
    pub fn type_class(&self, ty: VmType) -> Ref {
        self.type_classes[ty as usize]
    }

    #[inline]
    pub fn is_instance(&self, p: Ref, ty: VmType) -> bool {
        self.heap.class_of(p) == self.type_class(ty)
    }

    // ── field access by descriptor index ───────────────────────────

    #[inline]
    fn field_byte_offset(&self, ty: VmType, index: usize) -> usize {
        self.layouts[ty as usize].field_offsets[index] as usize
    }

    fn get_field_ref(&self, p: Ref, ty: VmType, index: usize) -> Ref {
        debug_assert!(self.is_instance(p, ty));
        let off = self.field_byte_offset(ty, index);
        Ref::from_raw(self.heap.get_word(p, off) as u32)
    }

    fn put_field_ref(&mut self, p: Ref, ty: VmType, index: usize, v: Ref) {
        let word = self.heap.abi().word_bytes();
        let off = self.field_byte_offset(ty, index);
        self.heap.put_ref(p, (off / word) as u32, v);
    }

    fn get_field_word(&self, p: Ref, ty: VmType, index: usize) -> u64 {
        debug_assert!(self.is_instance(p, ty));
        self.heap.get_word(p, self.field_byte_offset(ty, index))
    }

    fn put_field_word(&mut self, p: Ref, ty: VmType, index: usize, v: u64) {
        let off = self.field_byte_offset(ty, index);
        self.heap.put_word(p, off, v);
    }

    // ── class accessors ────────────────────────────────────────────

    pub fn class_name(&self, c: Ref) -> Ref {
        self.get_field_ref(c, VmType::Class, class_field::NAME)
    }

    pub fn class_loader(&self, c: Ref) -> Ref {
        self.get_field_ref(c, VmType::Class, class_field::LOADER)
    }

    pub fn class_field_table(&self, c: Ref) -> Ref {
        self.get_field_ref(c, VmType::Class, class_field::FIELD_TABLE)
    }

    pub fn class_method_table(&self, c: Ref) -> Ref {
        self.get_field_ref(c, VmType::Class, class_field::METHOD_TABLE)
    }

    pub fn class_static_table(&self, c: Ref) -> Ref {
        self.get_field_ref(c, VmType::Class, class_field::STATIC_TABLE)
    }

    pub fn class_flags(&self, c: Ref) -> u64 {
        self.get_field_word(c, VmType::Class, class_field::FLAGS)
    }

    pub fn class_fixed_size(&self, c: Ref) -> usize {
        self.get_field_word(c, VmType::Class, class_field::FIXED_SIZE) as usize
    }

    /// Build byte offset of the static-table slot within a class object.
    /// The heap-image visitor classifies any edge leaving a class at this
    /// offset as a fixed-object edge.
    pub fn class_static_table_offset(&self) -> u32 {
        self.field_byte_offset(VmType::Class, class_field::STATIC_TABLE) as u32
    }

    // ── field / method / code accessors ────────────────────────────

    pub fn field_name(&self, f: Ref) -> Ref {
        self.get_field_ref(f, VmType::Field, field_field::NAME)
    }

    pub fn field_code(&self, f: Ref) -> FieldCode {
        let raw = self.get_field_word(f, VmType::Field, field_field::CODE);
        FieldCode::from_raw(raw).expect("corrupt field code")
    }

    pub fn field_flags(&self, f: Ref) -> AccessFlags {
        let raw = self.get_field_word(f, VmType::Field, field_field::FLAGS);
        AccessFlags::from_bits_truncate(raw as u16)
    }

    pub fn field_offset(&self, f: Ref) -> usize {
        self.get_field_word(f, VmType::Field, field_field::OFFSET) as usize
    }

    pub fn method_name(&self, m: Ref) -> Ref {
        self.get_field_ref(m, VmType::Method, method_field::NAME)
    }

    pub fn method_spec(&self, m: Ref) -> Ref {
        self.get_field_ref(m, VmType::Method, method_field::SPEC)
    }

    pub fn method_flags(&self, m: Ref) -> AccessFlags {
        let raw = self.get_field_word(m, VmType::Method, method_field::FLAGS);
        AccessFlags::from_bits_truncate(raw as u16)
    }

    pub fn method_code(&self, m: Ref) -> Ref {
        self.get_field_ref(m, VmType::Method, method_field::CODE)
    }

    pub fn code_pool(&self, code: Ref) -> Ref {
        self.get_field_ref(code, VmType::Code, code_field::POOL)
    }

    pub fn code_compiled(&self, code: Ref) -> u64 {
        self.get_field_word(code, VmType::Code, code_field::COMPILED)
    }

    pub fn set_code_compiled(&mut self, code: Ref, address: u64) {
        self.put_field_word(code, VmType::Code, code_field::COMPILED, address);
    }

    pub fn code_bytes(&self, code: Ref) -> &[u8] {
        let word = self.heap.abi().word_bytes();
        let len = self.get_field_word(code, VmType::Code, code_field::LENGTH) as usize;
        let base = self.layout(VmType::Code).size_bytes as usize;
        debug_assert!(base == 4 * word);
        &self.heap.data(code)[base..base + len]
    }

    // ── arrays, byte arrays, strings, singletons ───────────────────

    pub fn array_length(&self, a: Ref) -> usize {
        debug_assert!(self.is_instance(a, VmType::Array));
        let word = self.heap.abi().word_bytes();
        self.heap.get_word(a, word) as usize
    }

    pub fn array_element(&self, a: Ref, index: usize) -> Ref {
        debug_assert!(index < self.array_length(a));
        self.heap.get_ref(a, (2 + index) as u32)
    }

    pub fn byte_array_bytes(&self, b: Ref) -> &[u8] {
        debug_assert!(self.is_instance(b, VmType::ByteArray));
        let word = self.heap.abi().word_bytes();
        let len = self.heap.get_word(b, word) as usize;
        &self.heap.data(b)[2 * word..2 * word + len]
    }

    pub fn byte_array_as_str(&self, b: Ref) -> &str {
        core::str::from_utf8(self.byte_array_bytes(b)).unwrap_or("")
    }

    pub fn singleton_count(&self, s: Ref) -> usize {
        debug_assert!(self.is_instance(s, VmType::Singleton));
        let word = self.heap.abi().word_bytes();
        self.heap.get_word(s, word) as usize
    }

    // ── constructors ───────────────────────────────────────────────

    fn make_internal(&mut self, ty: VmType) -> Ref {
        let l = &self.layouts[ty as usize];
        debug_assert!(l.tail.is_none());
        let size = l.size_bytes as usize;
        let refs = l.ref_offsets.clone();
        self.heap.alloc(self.type_classes[ty as usize], size, refs)
    }

    pub fn make_byte_array(&mut self, bytes: &[u8]) -> Ref {
        let word = self.heap.abi().word_bytes();
        let size = pad(2 * word + bytes.len(), word);
        let class = self.type_classes[VmType::ByteArray as usize];
        let b = self.heap.alloc(class, size, vec![0]);
        self.heap.put_word(b, word, bytes.len() as u64);
        self.heap.put_bytes(b, 2 * word, bytes);
        b
    }

    pub fn make_array(&mut self, elements: &[Ref]) -> Ref {
        let word = self.heap.abi().word_bytes();
        let size = (2 + elements.len()) * word;
        let mut refs = vec![0];
        refs.extend((2..2 + elements.len()).map(|i| i as u32));
        let class = self.type_classes[VmType::Array as usize];
        let a = self.heap.alloc(class, size, refs);
        self.heap.put_word(a, word, elements.len() as u64);
        for (i, &e) in elements.iter().enumerate() {
            self.heap.put_ref(a, (2 + i) as u32, e);
        }
        a
    }

    pub fn make_string(&mut self, s: &str) -> Ref {
        let data = self.make_byte_array(s.as_bytes());
        let obj = self.make_internal(VmType::Str);
        self.put_field_ref(obj, VmType::Str, string_field::DATA, data);
        self.put_field_word(obj, VmType::Str, string_field::OFFSET, 0);
        self.put_field_word(obj, VmType::Str, string_field::LENGTH, s.len() as u64);
        obj
    }

    pub fn intern_string(&mut self, s: &str) -> Ref {
        if let Some(&existing) = self.intern_table.get(s) {
            return existing;
        }
        let obj = self.make_string(s);
        self.intern_table.insert(s.to_string(), obj);
        obj
    }

    pub fn make_triple(&mut self, first: Ref, second: Ref, third: Ref) -> Ref {
        let t = self.make_internal(VmType::Triple);
        self.put_field_ref(t, VmType::Triple, triple_field::FIRST, first);
        self.put_field_ref(t, VmType::Triple, triple_field::SECOND, second);
        self.put_field_ref(t, VmType::Triple, triple_field::THIRD, third);
        t
    }

    pub fn make_code(&mut self, pool: Ref, bytecode: &[u8]) -> Ref {
        let word = self.heap.abi().word_bytes();
        let base = self.layout(VmType::Code).size_bytes as usize;
        let size = pad(base + bytecode.len(), word);
        let class = self.type_classes[VmType::Code as usize];
        let refs = self.layout(VmType::Code).ref_offsets.clone();
        let code = self.heap.alloc(class, size, refs);
        self.put_field_ref(code, VmType::Code, code_field::POOL, pool);
        self.put_field_word(code, VmType::Code, code_field::LENGTH, bytecode.len() as u64);
        self.heap.put_bytes(code, base, bytecode);
        code
    }

    /// A singleton with `count` body words; `ref_slots` are absolute word
    /// offsets (the body begins at word 2).
    pub fn make_singleton(&mut self, count: usize, ref_slots: &[u32]) -> Ref {
        let word = self.heap.abi().word_bytes();
        let size = (2 + count) * word;
        let mut refs = vec![0];
        refs.extend_from_slice(ref_slots);
        let class = self.type_classes[VmType::Singleton as usize];
        let s = self.heap.alloc(class, size, refs);
        self.heap.put_word(s, word, count as u64);
        s
    }

    #[allow(clippy::too_many_arguments)]
    pub fn make_class(
        &mut self,
        name: &str,
        loader: Ref,
        field_table: Ref,
        method_table: Ref,
        static_table: Ref,
        flags: u64,
        fixed_size: usize,
    ) -> Ref {
        let name = self.make_byte_array(name.as_bytes());
        let c = self.make_internal(VmType::Class);
        self.put_field_ref(c, VmType::Class, class_field::NAME, name);
        self.put_field_ref(c, VmType::Class, class_field::LOADER, loader);
        self.put_field_ref(c, VmType::Class, class_field::FIELD_TABLE, field_table);
        self.put_field_ref(c, VmType::Class, class_field::METHOD_TABLE, method_table);
        self.put_field_ref(c, VmType::Class, class_field::STATIC_TABLE, static_table);
        self.put_field_word(c, VmType::Class, class_field::FLAGS, flags);
        self.put_field_word(c, VmType::Class, class_field::FIXED_SIZE, fixed_size as u64);
        c
    }

    fn make_field(
        &mut self,
        name: &str,
        code: FieldCode,
        flags: AccessFlags,
        offset: usize,
    ) -> Ref {
        let name = self.make_byte_array(name.as_bytes());
        let f = self.make_internal(VmType::Field);
        self.put_field_ref(f, VmType::Field, field_field::NAME, name);
        self.put_field_word(f, VmType::Field, field_field::CODE, code as u64);
        self.put_field_word(f, VmType::Field, field_field::FLAGS, flags.bits() as u64);
        self.put_field_word(f, VmType::Field, field_field::OFFSET, offset as u64);
        f
    }

    fn make_method(
        &mut self,
        name: &str,
        spec: &str,
        flags: AccessFlags,
        code: Ref,
    ) -> Ref {
        let name = self.make_byte_array(name.as_bytes());
        let spec = self.make_byte_array(spec.as_bytes());
        let m = self.make_internal(VmType::Method);
        self.put_field_ref(m, VmType::Method, method_field::NAME, name);
        self.put_field_ref(m, VmType::Method, method_field::SPEC, spec);
        self.put_field_word(m, VmType::Method, method_field::FLAGS, flags.bits() as u64);
        self.put_field_ref(m, VmType::Method, method_field::CODE, code);
        m
    }

    // ── class resolution ───────────────────────────────────────────

    pub fn find_class(&self, name: &str) -> Option<Ref> {
        self.boot_dictionary.get(name).copied()
    }

    /// Resolve a class from its mapped `.class` region, building its field
    /// and method tables, static table, and constant-pool singleton, and
    /// registering it with the boot loader. Idempotent by name.
    pub fn resolve_system_class(
        &mut self,
        name: &str,
        bytes: &[u8],
    ) -> Result<Ref, ClassFileError> {
        if let Some(c) = self.find_class(name) {
            return Ok(c);
        }

        let parsed = classfile::parse(bytes)?;
        let build = self.heap.abi();
        let word = build.word_bytes();

        let mut member_offset = word;
        // Static slots live in a singleton body: class word, then length.
        let mut static_offset = 2 * word;
        let mut static_ref_slots = Vec::new();
        let mut field_objects = Vec::new();
        let mut static_inits: Vec<(usize, StaticInit)> = Vec::new();

        for pf in &parsed.fields {
            let code = FieldCode::from_descriptor(&pf.descriptor)?;
            let size = code.size(build);
            let offset = if pf.flags.contains(AccessFlags::STATIC) {
                while static_offset % size != 0 {
                    static_offset += 1;
                }
                let o = static_offset;
                static_offset += size;
                if code == FieldCode::Object {
                    static_ref_slots.push((o / word) as u32);
                }
                if let Some(cv) = pf.constant_value {
                    static_inits.push((o, StaticInit::resolve(&parsed, cv, build)?));
                }
                o
            } else {
                while member_offset % size != 0 {
                    member_offset += 1;
                }
                let o = member_offset;
                member_offset += size;
                o
            };
            let f = self.make_field(&pf.name, code, pf.flags, offset);
            field_objects.push(f);
        }

        let field_table = if field_objects.is_empty() {
            Ref::NULL
        } else {
            self.make_array(&field_objects)
        };

        let static_table = if static_offset > 2 * word {
            let count = ceiling(static_offset - 2 * word, word);
            let s = self.make_singleton(count, &static_ref_slots);
            for (offset, init) in static_inits {
                match init {
                    StaticInit::Raw4(b) => self.heap.put_bytes(s, offset, &b),
                    StaticInit::Raw8(b) => self.heap.put_bytes(s, offset, &b),
                    StaticInit::Str(text) => {
                        let value = self.intern_string(&text);
                        self.heap.put_ref(s, (offset / word) as u32, value);
                    }
                }
            }
            s
        } else {
            Ref::NULL
        };

        let pool = self.build_pool(&parsed)?;

        let mut method_objects = Vec::new();
        for pm in &parsed.methods {
            let code = match &pm.code {
                Some(bytecode) => self.make_code(pool.unwrap_or(Ref::NULL), bytecode),
                None => Ref::NULL,
            };
            let m = self.make_method(&pm.name, &pm.descriptor, pm.flags, code);
            method_objects.push(m);
        }
        let method_table = if method_objects.is_empty() {
            Ref::NULL
        } else {
            self.make_array(&method_objects)
        };

        let boot = self.boot_loader;
        let class = self.make_class(
            name,
            boot,
            field_table,
            method_table,
            static_table,
            parsed.flags.bits() as u64,
            pad(member_offset, word),
        );

        if let Some(pool) = pool {
            self.pool_map.insert(class, pool);
        }
        self.boot_dictionary.insert(name.to_string(), class);
        debug!(
            "resolved {name}: {} fields, {} methods",
            parsed.fields.len(),
            parsed.methods.len()
        );
        Ok(class)
    }

    /// Build the runtime constant-pool singleton for a parsed class: one body
    /// word per pool slot, holding interned strings and byte arrays for
    /// object entries and raw bits for numeric ones.
    fn build_pool(
        &mut self,
        parsed: &ParsedClass,
    ) -> Result<Option<Ref>, ClassFileError> {
        let count = parsed.pool.len() - 1;
        if count == 0 {
            return Ok(None);
        }

        enum Slot {
            Nothing,
            Obj(Ref),
            Raw4([u8; 4]),
            Raw8([u8; 8]),
        }

        let build = self.heap.abi();
        let word = build.word_bytes();
        let mut slots = Vec::with_capacity(count);
        for entry in &parsed.pool[1..] {
            let slot = match entry {
                PoolEntry::Utf8(bytes) => {
                    let bytes = bytes.clone();
                    Slot::Obj(self.make_byte_array(&bytes))
                }
                PoolEntry::Integer(v) => {
                    let mut b = [0u8; 4];
                    build.put32(&mut b, *v as u32);
                    Slot::Raw4(b)
                }
                PoolEntry::Float(v) => {
                    let mut b = [0u8; 4];
                    build.put32(&mut b, v.to_bits());
                    Slot::Raw4(b)
                }
                PoolEntry::Long(v) => {
                    let mut b = [0u8; 8];
                    build.put64(&mut b, *v as u64);
                    Slot::Raw8(b)
                }
                PoolEntry::Double(v) => {
                    let mut b = [0u8; 8];
                    build.put64(&mut b, v.to_bits());
                    Slot::Raw8(b)
                }
                PoolEntry::StringRef(idx) => {
                    let s = parsed.utf8(*idx)?.to_string();
                    Slot::Obj(self.intern_string(&s))
                }
                _ => Slot::Nothing,
            };
            slots.push(slot);
        }

        let ref_slots: Vec<u32> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Slot::Obj(_)))
            .map(|(i, _)| (2 + i) as u32)
            .collect();

        let pool = self.make_singleton(count, &ref_slots);
        for (i, slot) in slots.into_iter().enumerate() {
            let offset = (2 + i) * word;
            match slot {
                Slot::Nothing => {}
                Slot::Obj(r) => self.heap.put_ref(pool, (2 + i) as u32, r),
                Slot::Raw4(b) => self.heap.put_bytes(pool, offset, &b),
                Slot::Raw8(b) => self.heap.put_bytes(pool, offset, &b),
            }
        }
        Ok(Some(pool))
    }

    /// Materialize the class dictionaries as heap arrays of
    /// `(name, class, -)` triples and hang them off their loaders. Must run
    /// after all classes are resolved and before the heap walk.
    pub fn seal(&mut self) {
        let word = self.heap.abi().word_bytes();
        let dict_slot = (self.field_byte_offset(
            VmType::SystemClassLoader,
            loader_field::DICTIONARY,
        ) / word) as u32;

        for (loader, entries) in [
            (self.boot_loader, self.boot_dictionary.values().copied().collect::<Vec<_>>()),
            (self.app_loader, self.app_dictionary.values().copied().collect::<Vec<_>>()),
        ] {
            let mut triples = Vec::with_capacity(entries.len());
            for class in entries {
                let name = self.class_name(class);
                triples.push(self.make_triple(name, class, Ref::NULL));
            }
            let dictionary = self.make_array(&triples);
            self.heap.put_ref(loader, dict_slot, dictionary);
        }
    }
}
