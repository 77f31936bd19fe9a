use std::collections::HashMap;

use abi::{ceiling, Abi};
use runtime::classfile::{pool_tag, ClassFileError, Reader, CLASS_MAGIC};
use runtime::{FieldCode, Machine, Ref, Type, VmType};

use crate::error::{Error, Result};

/// One mapped field: its tag and its byte offsets in the build and target
/// layouts.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub ty: Type,
    pub build_offset: u32,
    pub target_offset: u32,
}

/// Trailing-mask layout of the entity a map describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Normal,
    Singleton,
    Pool,
}

/// Build→target transcription recipe for one entity: the fixed-prefix
/// geometry, the mapped fields, a direct build-offset → target-offset table,
/// and the optional tail-array element description.
#[derive(Debug)]
pub struct TypeMap {
    pub build_fixed_words: u32,
    pub target_fixed_words: u32,
    pub fields: Vec<Field>,
    /// Indexed by build byte offset; unmapped bytes read 0.
    pub target_fixed_offsets: Vec<u32>,
    pub build_array_elem_bytes: u32,
    pub target_array_elem_bytes: u32,
    pub array_elem_type: Type,
    pub kind: Kind,
}

impl TypeMap {
    pub fn new(
        build_fixed_words: u32,
        target_fixed_words: u32,
        kind: Kind,
        build: Abi,
    ) -> Self {
        let table = build_fixed_words as usize * build.word_bytes();
        Self {
            build_fixed_words,
            target_fixed_words,
            fields: Vec::new(),
            target_fixed_offsets: vec![0; table],
            build_array_elem_bytes: 0,
            target_array_elem_bytes: 0,
            array_elem_type: Type::None,
            kind,
        }
    }

    pub fn with_array(
        mut self,
        build_elem_bytes: u32,
        target_elem_bytes: u32,
        elem_type: Type,
    ) -> Self {
        self.build_array_elem_bytes = build_elem_bytes;
        self.target_array_elem_bytes = target_elem_bytes;
        self.array_elem_type = elem_type;
        self
    }

    pub fn add_field(&mut self, ty: Type, build_offset: u32, target_offset: u32) {
        assert!(
            (build_offset as usize) < self.target_fixed_offsets.len(),
            "field build offset {build_offset} outside fixed prefix of {} bytes",
            self.target_fixed_offsets.len()
        );
        self.target_fixed_offsets[build_offset as usize] = target_offset;
        self.fields.push(Field { ty, build_offset, target_offset });
    }

    #[inline(always)]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    #[inline(always)]
    pub fn has_array(&self) -> bool {
        self.target_array_elem_bytes != 0
    }
}

/// Build the Pool-kind map for a class's constant pool by scanning the
/// mapped class-file region. Returns `None` when the pool is empty.
pub fn pool_type_map(
    class_bytes: &[u8],
    build: Abi,
    target: Abi,
) -> Result<Option<TypeMap>> {
    let mut r = Reader::new(class_bytes);

    let magic = r.read4()?;
    if magic != CLASS_MAGIC {
        return Err(Error::MalformedClass(ClassFileError::BadMagic(magic)));
    }
    r.read2()?; // minor version
    r.read2()?; // major version

    let count = r.read2()? as usize - 1;
    if count == 0 {
        return Ok(None);
    }

    // Two leading slots describe the pool object's own header.
    let mut types = vec![Type::None; count + 2];
    types[0] = Type::Object;
    types[1] = Type::IWord;

    let mut i = 2;
    while i < count + 2 {
        match r.read1()? {
            pool_tag::CLASS | pool_tag::STRING => {
                types[i] = Type::Object;
                r.skip(2)?;
            }
            pool_tag::INTEGER | pool_tag::FLOAT => {
                types[i] = Type::I32;
                r.skip(4)?;
            }
            pool_tag::NAME_AND_TYPE
            | pool_tag::FIELDREF
            | pool_tag::METHODREF
            | pool_tag::INTERFACE_METHODREF => {
                types[i] = Type::Object;
                r.skip(4)?;
            }
            pool_tag::LONG => {
                types[i] = Type::I64;
                i += 1;
                types[i] = Type::I64Pad;
                r.skip(8)?;
            }
            pool_tag::DOUBLE => {
                types[i] = Type::F64;
                i += 1;
                types[i] = Type::F64Pad;
                r.skip(8)?;
            }
            pool_tag::UTF8 => {
                types[i] = Type::Object;
                let len = r.read2()? as usize;
                r.skip(len)?;
            }
            other => {
                return Err(Error::MalformedClass(
                    ClassFileError::UnknownPoolTag(other),
                ));
            }
        }
        i += 1;
    }

    let words = (count + 2) as u32;
    let mut map = TypeMap::new(words, words, Kind::Pool, build);
    for (i, &ty) in types.iter().enumerate() {
        map.add_field(
            ty,
            (i * build.word_bytes()) as u32,
            (i * target.word_bytes()) as u32,
        );
    }
    Ok(Some(map))
}

/// Target tag and alignment size for a source field code. Object slots are
/// always a target word wide; char and short keep the `i8` tag the source
/// layout machinery has always used (the copy truncates, the alignment does
/// not).
fn field_policy(code: FieldCode, target: Abi) -> (Type, usize) {
    match code {
        FieldCode::Object => (Type::Object, target.word_bytes()),
        FieldCode::Byte | FieldCode::Boolean => (Type::I8, 1),
        FieldCode::Char | FieldCode::Short => (Type::I8, 2),
        FieldCode::Int | FieldCode::Float => (Type::I32, 4),
        FieldCode::Long | FieldCode::Double => (Type::I64, 8),
    }
}

/// Build the Normal-kind instance map and, when the class has statics, the
/// Singleton-kind static-table map, from the class's resolved field table.
pub fn class_maps(
    m: &Machine,
    class: Ref,
    build: Abi,
    target: Abi,
) -> (TypeMap, Option<(Ref, TypeMap)>) {
    let bw = build.word_bytes();
    let tw = target.word_bytes();

    let mut member_fields = vec![(Type::Object, 0u32, 0u32)];
    let mut target_member_offset = tw;

    let mut static_fields = vec![
        (Type::Object, 0u32, 0u32),
        (Type::IWord, bw as u32, tw as u32),
    ];
    let mut target_static_offset = 2 * tw;

    let table = m.class_field_table(class);
    for i in 0..m.array_length(table) {
        let field = m.array_element(table, i);
        let (ty, size) = field_policy(m.field_code(field), target);
        let build_offset = m.field_offset(field) as u32;

        if m.field_flags(field).contains(runtime::AccessFlags::STATIC) {
            while target_static_offset % size != 0 {
                target_static_offset += 1;
            }
            static_fields.push((ty, build_offset, target_static_offset as u32));
            target_static_offset += size;
        } else {
            while target_member_offset % size != 0 {
                target_member_offset += 1;
            }
            member_fields.push((ty, build_offset, target_member_offset as u32));
            target_member_offset += size;
        }
    }

    let mut member_map = TypeMap::new(
        ceiling(m.class_fixed_size(class), bw) as u32,
        ceiling(target_member_offset, tw) as u32,
        Kind::Normal,
        build,
    );
    for (ty, b, t) in member_fields {
        member_map.add_field(ty, b, t);
    }

    let static_table = m.class_static_table(class);
    let static_map = if static_table.is_null() {
        None
    } else {
        let mut map = TypeMap::new(
            (m.singleton_count(static_table) + 2) as u32,
            ceiling(target_static_offset, tw) as u32,
            Kind::Singleton,
            build,
        );
        for (ty, b, t) in static_fields {
            map.add_field(ty, b, t);
        }
        Some((static_table, map))
    };

    (member_map, static_map)
}

/// Build a Normal-kind map from a hard-coded internal type descriptor. An
/// `ArrayMarker` splits the fixed prefix from the tail element type.
pub fn descriptor_map(desc: &[Type], build: Abi, target: Abi) -> TypeMap {
    let bw = build.word_bytes();
    let tw = target.word_bytes();

    // Implicit leading class word.
    let mut fields = vec![(Type::Object, 0u32, 0u32)];
    let mut build_offset = bw;
    let mut target_offset = tw;
    let mut saw_array = false;
    let mut build_size = bw;
    let mut target_size = tw;
    let mut elem_type = Type::None;

    for &source in desc {
        let ty = match source {
            Type::Object => {
                build_size = bw;
                target_size = tw;
                Type::Object
            }
            Type::Word | Type::IWord | Type::UWord => {
                build_size = bw;
                target_size = tw;
                Type::IWord
            }
            Type::I8 | Type::U8 => {
                build_size = 1;
                target_size = 1;
                Type::I8
            }
            Type::I16 | Type::U16 => {
                build_size = 2;
                target_size = 2;
                Type::I16
            }
            Type::I32 | Type::U32 | Type::F32 => {
                build_size = 4;
                target_size = 4;
                Type::I32
            }
            Type::I64 | Type::U64 | Type::F64 => {
                build_size = 8;
                target_size = 8;
                Type::I64
            }
            Type::ArrayMarker => {
                build_size = 0;
                target_size = 0;
                saw_array = true;
                Type::None
            }
            other => unreachable!("descriptor tag {other:?}"),
        };

        if saw_array {
            elem_type = ty;
            continue;
        }

        while build_offset % build_size != 0 {
            build_offset += 1;
        }
        while target_offset % target_size != 0 {
            target_offset += 1;
        }
        fields.push((ty, build_offset as u32, target_offset as u32));
        build_offset += build_size;
        target_offset += target_size;
    }

    let mut map = TypeMap::new(
        ceiling(build_offset, bw) as u32,
        ceiling(target_offset, tw) as u32,
        Kind::Normal,
        build,
    );
    if saw_array {
        map = map.with_array(build_size as u32, target_size as u32, elem_type);
    }
    for (ty, b, t) in fields {
        map.add_field(ty, b, t);
    }
    map
}

/// The map registry. Singleton instances (static tables, constant pools) are
/// keyed by the object itself; everything else by its class.
pub struct TypeMaps {
    maps: HashMap<Ref, TypeMap>,
}

impl TypeMaps {
    pub fn new() -> Self {
        Self { maps: HashMap::new() }
    }

    /// Install a map; a pre-existing same-key entry is replaced.
    pub fn insert(&mut self, key: Ref, map: TypeMap) {
        self.maps.insert(key, map);
    }

    pub fn by_key(&self, key: Ref) -> Option<&TypeMap> {
        self.maps.get(&key)
    }

    /// The map governing object `p`. Every walked object must have one.
    pub fn get(&self, m: &Machine, p: Ref) -> &TypeMap {
        let key = if m.is_instance(p, VmType::Singleton) {
            p
        } else {
            m.heap.class_of(p)
        };
        self.maps
            .get(&key)
            .unwrap_or_else(|| panic!("object {p:?} has no type map"))
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

impl Default for TypeMaps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{Endian, WordSize};
    use runtime::testutil::ClassBuilder;
    use runtime::AccessFlags;

    const B64: Abi = Abi { word: WordSize::W64, endian: Endian::Little };
    const B32: Abi = Abi { word: WordSize::W32, endian: Endian::Little };

    /// A bare class-file prefix holding only a constant pool; the pool scan
    /// never reads past it.
    fn pool_only(entries: &[&[u8]], count: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(0xCAFE_BABEu32.to_be_bytes());
        out.extend([0u8; 4]); // versions
        out.extend(count.to_be_bytes());
        for e in entries {
            out.extend(*e);
        }
        out
    }

    #[test]
    fn pool_map_for_class_long_utf8() {
        // [Class, Long, Utf8] — the Long consumes its shadow slot.
        let bytes = pool_only(
            &[
                &[pool_tag::CLASS, 0, 4],
                &[pool_tag::LONG, 1, 2, 3, 4, 5, 6, 7, 8],
                &[pool_tag::UTF8, 0, 1, b'A'],
            ],
            5,
        );
        let map = pool_type_map(&bytes, B64, B64)
            .expect("scan")
            .expect("non-empty pool");
        assert_eq!(map.kind, Kind::Pool);
        assert_eq!(map.build_fixed_words, 6);
        let tags: Vec<Type> = map.fields.iter().map(|f| f.ty).collect();
        assert_eq!(
            tags,
            vec![
                Type::Object,
                Type::IWord,
                Type::Object,
                Type::I64,
                Type::I64Pad,
                Type::Object,
            ]
        );
    }

    #[test]
    fn pool_map_single_entry_has_three_fields() {
        let bytes = pool_only(&[&[pool_tag::UTF8, 0, 1, b'x']], 2);
        let map = pool_type_map(&bytes, B64, B64)
            .expect("scan")
            .expect("non-empty");
        assert_eq!(map.field_count(), 3);
        assert_eq!(map.fields[0].ty, Type::Object);
        assert_eq!(map.fields[1].ty, Type::IWord);
        assert_eq!(map.fields[2].ty, Type::Object);
    }

    #[test]
    fn empty_pool_yields_no_map() {
        let bytes = pool_only(&[], 1);
        assert!(pool_type_map(&bytes, B64, B64).expect("scan").is_none());
    }

    #[test]
    fn pool_scan_rejects_unknown_tags() {
        let bytes = pool_only(&[&[99, 0, 0]], 2);
        assert!(matches!(
            pool_type_map(&bytes, B64, B64),
            Err(Error::MalformedClass(ClassFileError::UnknownPoolTag(99)))
        ));
    }

    #[test]
    fn single_int_field_member_map() {
        let mut m = Machine::bootstrap(B64);
        let bytes = ClassBuilder::new("A")
            .field(AccessFlags::empty(), "x", "I")
            .build();
        let class = m.resolve_system_class("A", &bytes).expect("resolve");
        let (member, statics) = class_maps(&m, class, B64, B64);
        assert!(statics.is_none());
        assert_eq!(member.field_count(), 2);
        assert_eq!(member.fields[0].build_offset, 0);
        assert_eq!(member.fields[1].ty, Type::I32);
        assert_eq!(member.fields[1].build_offset, 8);
        assert_eq!(member.fields[1].target_offset, 8);
        // ⌈(word + 4) / word⌉
        assert_eq!(member.target_fixed_words, 2);
    }

    #[test]
    fn long_field_padding_for_wide_target() {
        let mut m = Machine::bootstrap(B32);
        let bytes = ClassBuilder::new("L")
            .field(AccessFlags::empty(), "a", "I")
            .field(AccessFlags::empty(), "b", "J")
            .build();
        let class = m.resolve_system_class("L", &bytes).expect("resolve");
        let (member, _) = class_maps(&m, class, B32, B64);
        // Members start after the 8-byte class word on the 64-bit target:
        // `a` lands at 8, `b` aligns up to 16.
        assert_eq!(member.fields[1].target_offset, 8);
        assert_eq!(member.fields[2].target_offset, 16);
        assert_eq!(member.target_fixed_words, 3);
        // Build side is 32-bit: class word 4, `a` at 4, `b` aligned to 8.
        assert_eq!(member.fields[1].build_offset, 4);
        assert_eq!(member.fields[2].build_offset, 8);
    }

    #[test]
    fn static_map_leads_with_header_pair() {
        let mut m = Machine::bootstrap(B64);
        let bytes = ClassBuilder::new("S")
            .field(AccessFlags::STATIC, "s", "Ljava/lang/Object;")
            .build();
        let class = m.resolve_system_class("S", &bytes).expect("resolve");
        let (_, statics) = class_maps(&m, class, B64, B64);
        let (table, map) = statics.expect("static table");
        assert!(m.is_instance(table, VmType::Singleton));
        assert_eq!(map.kind, Kind::Singleton);
        assert_eq!(map.fields[0].ty, Type::Object);
        assert_eq!(map.fields[1].ty, Type::IWord);
        assert_eq!(map.fields[2].ty, Type::Object);
        assert_eq!(map.fields[2].target_offset, 16);
    }

    #[test]
    fn offset_table_matches_fields() {
        let mut m = Machine::bootstrap(B64);
        let bytes = ClassBuilder::new("O")
            .field(AccessFlags::empty(), "a", "B")
            .field(AccessFlags::empty(), "b", "J")
            .field(AccessFlags::empty(), "c", "I")
            .build();
        let class = m.resolve_system_class("O", &bytes).expect("resolve");
        let (member, _) = class_maps(&m, class, B64, B64);
        for f in &member.fields {
            assert_eq!(
                member.target_fixed_offsets[f.build_offset as usize],
                f.target_offset
            );
            let size = f.ty.size(B64);
            if size > 0 {
                assert_eq!(f.target_offset as usize % size, 0, "{f:?}");
            }
        }
    }

    #[test]
    fn descriptor_map_agrees_with_runtime_layout() {
        for ty in VmType::ALL {
            let map = descriptor_map(ty.descriptor(), B64, B64);
            let layout = runtime::layout(ty.descriptor(), B64);
            // Skip the implicit class-word field when comparing.
            let offsets: Vec<u32> =
                map.fields[1..].iter().map(|f| f.build_offset).collect();
            assert_eq!(offsets, layout.field_offsets, "{ty:?}");
            assert_eq!(
                map.build_fixed_words * 8,
                layout.size_bytes,
                "{ty:?} prefix size"
            );
            assert_eq!(map.has_array(), layout.tail.is_some(), "{ty:?}");
        }
    }

    #[test]
    fn descriptor_map_array_tail() {
        let map = descriptor_map(VmType::ByteArray.descriptor(), B32, B64);
        assert!(map.has_array());
        assert_eq!(map.array_elem_type, Type::I8);
        assert_eq!(map.build_array_elem_bytes, 1);
        assert_eq!(map.target_array_elem_bytes, 1);
        // class word + length
        assert_eq!(map.field_count(), 2);
        assert_eq!(map.build_fixed_words, 2);
        assert_eq!(map.target_fixed_words, 2);
    }

    #[test]
    #[should_panic(expected = "outside fixed prefix")]
    fn field_outside_prefix_aborts() {
        let mut map = TypeMap::new(1, 1, Kind::Normal, B64);
        map.add_field(Type::I8, 8, 8);
    }
}
