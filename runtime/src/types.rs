use abi::{pad, Abi};

/// Primitive type tag used by field-layout descriptors and type maps.
///
/// The `*Pad` tags model the trailing half of a double-wide slot and emit
/// nothing. `Word` aliases the pointer width of whichever ABI is in play.
/// `ArrayMarker` ends a descriptor's fixed prefix; the tag after it describes
/// the tail array's element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    None,
    Object,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    IWord,
    UWord,
    I64,
    I64Pad,
    U64,
    F32,
    F64,
    F64Pad,
    Word,
    ArrayMarker,
}

impl Type {
    /// Storage size of one value of this type under `abi`. Pads, `None` and
    /// the array marker occupy nothing.
    pub fn size(self, abi: Abi) -> usize {
        match self {
            Type::Object | Type::IWord | Type::UWord | Type::Word => {
                abi.word_bytes()
            }
            Type::I8 | Type::U8 => 1,
            Type::I16 | Type::U16 => 2,
            Type::I32 | Type::U32 | Type::F32 => 4,
            Type::I64 | Type::U64 | Type::F64 => 8,
            Type::None | Type::I64Pad | Type::F64Pad | Type::ArrayMarker => 0,
        }
    }
}

/// The VM's internal object types, in types-array order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum VmType {
    Class = 0,
    Field,
    Method,
    Code,
    Array,
    ByteArray,
    Str,
    Triple,
    SystemClassLoader,
    Singleton,
}

impl VmType {
    pub const COUNT: usize = 10;

    pub const ALL: [VmType; Self::COUNT] = [
        VmType::Class,
        VmType::Field,
        VmType::Method,
        VmType::Code,
        VmType::Array,
        VmType::ByteArray,
        VmType::Str,
        VmType::Triple,
        VmType::SystemClassLoader,
        VmType::Singleton,
    ];

    pub fn name(self) -> &'static str {
        match self {
            VmType::Class => "vm/Class",
            VmType::Field => "vm/Field",
            VmType::Method => "vm/Method",
            VmType::Code => "vm/Code",
            VmType::Array => "vm/Array",
            VmType::ByteArray => "vm/ByteArray",
            VmType::Str => "vm/String",
            VmType::Triple => "vm/Triple",
            VmType::SystemClassLoader => "vm/SystemClassLoader",
            VmType::Singleton => "vm/Singleton",
        }
    }

    /// Field-layout descriptor, not counting the implicit leading class word.
    /// A descriptor with an `ArrayMarker` keeps its `Word`-typed length field
    /// as the last entry of the fixed prefix — the element count is read from
    /// the last word of the prefix.
    pub fn descriptor(self) -> &'static [Type] {
        use Type::*;
        match self {
            // name, loader, field_table, method_table, static_table,
            // flags, fixed_size
            VmType::Class => {
                &[Object, Object, Object, Object, Object, Word, Word]
            }
            // name, code, flags, offset
            VmType::Field => &[Object, Word, Word, Word],
            // name, spec, flags, code
            VmType::Method => &[Object, Object, Word, Object],
            // pool, compiled, length, bytecode...
            VmType::Code => &[Object, Word, Word, ArrayMarker, U8],
            VmType::Array => &[Word, ArrayMarker, Object],
            VmType::ByteArray => &[Word, ArrayMarker, I8],
            // data, offset, length
            VmType::Str => &[Object, Word, Word],
            VmType::Triple => &[Object, Object, Object],
            // parent, dictionary
            VmType::SystemClassLoader => &[Object, Object],
            VmType::Singleton => &[Word, ArrayMarker, Word],
        }
    }
}

// Field indices into the descriptors above (class word excluded).

pub mod class_field {
    pub const NAME: usize = 0;
    pub const LOADER: usize = 1;
    pub const FIELD_TABLE: usize = 2;
    pub const METHOD_TABLE: usize = 3;
    pub const STATIC_TABLE: usize = 4;
    pub const FLAGS: usize = 5;
    pub const FIXED_SIZE: usize = 6;
}

pub mod field_field {
    pub const NAME: usize = 0;
    pub const CODE: usize = 1;
    pub const FLAGS: usize = 2;
    pub const OFFSET: usize = 3;
}

pub mod method_field {
    pub const NAME: usize = 0;
    pub const SPEC: usize = 1;
    pub const FLAGS: usize = 2;
    pub const CODE: usize = 3;
}

pub mod code_field {
    pub const POOL: usize = 0;
    pub const COMPILED: usize = 1;
    pub const LENGTH: usize = 2;
}

pub mod string_field {
    pub const DATA: usize = 0;
    pub const OFFSET: usize = 1;
    pub const LENGTH: usize = 2;
}

pub mod triple_field {
    pub const FIRST: usize = 0;
    pub const SECOND: usize = 1;
    pub const THIRD: usize = 2;
}

pub mod loader_field {
    pub const PARENT: usize = 0;
    pub const DICTIONARY: usize = 1;
}

/// Tail-array element description.
#[derive(Debug, Clone, Copy)]
pub struct ArrayTail {
    pub ty: Type,
    pub elem_bytes: u32,
}

/// Build-side layout of one internal type under a given ABI.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Fixed-prefix size in bytes, word-aligned.
    pub size_bytes: u32,
    /// Byte offset of each descriptor field (class word excluded).
    pub field_offsets: Vec<u32>,
    /// Word offsets of every reference slot in the fixed prefix, class word
    /// included.
    pub ref_offsets: Vec<u32>,
    pub tail: Option<ArrayTail>,
}

impl Layout {
    /// Byte offset of the tail array's length slot — the last word of the
    /// fixed prefix.
    pub fn length_offset(&self, abi: Abi) -> u32 {
        debug_assert!(self.tail.is_some());
        self.size_bytes - abi.word_bytes() as u32
    }
}

/// Assign build offsets for `desc` under `abi`: fields in declaration order,
/// each aligned to its natural size, starting after the class word.
pub fn layout(desc: &[Type], abi: Abi) -> Layout {
    let word = abi.word_bytes() as u32;
    let mut offset = word;
    let mut field_offsets = Vec::new();
    let mut ref_offsets = vec![0];
    let mut tail = None;

    let mut iter = desc.iter();
    while let Some(&ty) = iter.next() {
        if ty == Type::ArrayMarker {
            let &elem = iter.next().expect("array marker without element type");
            tail = Some(ArrayTail { ty: elem, elem_bytes: elem.size(abi) as u32 });
            break;
        }
        let size = ty.size(abi) as u32;
        while offset % size != 0 {
            offset += 1;
        }
        field_offsets.push(offset);
        if ty == Type::Object {
            ref_offsets.push(offset / word);
        }
        offset += size;
    }

    Layout {
        size_bytes: pad(offset as usize, word as usize) as u32,
        field_offsets,
        ref_offsets,
        tail,
    }
}
