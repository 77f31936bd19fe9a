use core::fmt;

use abi::Abi;
use bitflags::bitflags;

pub const CLASS_MAGIC: u32 = 0xCAFE_BABE;

/// Constant-pool entry tags from the class-file format.
pub mod pool_tag {
    pub const UTF8: u8 = 1;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const CLASS: u8 = 7;
    pub const STRING: u8 = 8;
    pub const FIELDREF: u8 = 9;
    pub const METHODREF: u8 = 10;
    pub const INTERFACE_METHODREF: u8 = 11;
    pub const NAME_AND_TYPE: u8 = 12;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
    }
}

#[derive(Debug)]
pub enum ClassFileError {
    BadMagic(u32),
    UnknownPoolTag(u8),
    BadPoolIndex(u16),
    BadUtf8,
    UnsupportedFieldCode(char),
    Truncated,
}

impl fmt::Display for ClassFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassFileError::BadMagic(m) => {
                write!(f, "bad class magic {m:#010x}")
            }
            ClassFileError::UnknownPoolTag(t) => {
                write!(f, "unknown constant pool tag {t}")
            }
            ClassFileError::BadPoolIndex(i) => {
                write!(f, "constant pool index {i} out of range")
            }
            ClassFileError::BadUtf8 => write!(f, "malformed utf8 constant"),
            ClassFileError::UnsupportedFieldCode(c) => {
                write!(f, "unsupported field descriptor '{c}'")
            }
            ClassFileError::Truncated => write!(f, "truncated class file"),
        }
    }
}

impl std::error::Error for ClassFileError {}

/// Cursor over a mapped class-file region.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read1(&mut self) -> Result<u8, ClassFileError> {
        let v = *self.bytes.get(self.pos).ok_or(ClassFileError::Truncated)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read2(&mut self) -> Result<u16, ClassFileError> {
        Ok(((self.read1()? as u16) << 8) | self.read1()? as u16)
    }

    pub fn read4(&mut self) -> Result<u32, ClassFileError> {
        Ok(((self.read2()? as u32) << 16) | self.read2()? as u32)
    }

    pub fn read8(&mut self) -> Result<u64, ClassFileError> {
        Ok(((self.read4()? as u64) << 32) | self.read4()? as u64)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ClassFileError> {
        if self.pos + n > self.bytes.len() {
            return Err(ClassFileError::Truncated);
        }
        self.pos += n;
        Ok(())
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ClassFileError> {
        if self.pos + n > self.bytes.len() {
            return Err(ClassFileError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

/// A parsed constant-pool slot. Index 0 and the shadow slot after a
/// `Long`/`Double` hold `Empty`.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEntry {
    Empty,
    Utf8(Vec<u8>),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    ClassRef(u16),
    StringRef(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
}

#[derive(Debug)]
pub struct ParsedField {
    pub flags: AccessFlags,
    pub name: String,
    pub descriptor: String,
    /// Pool index from a `ConstantValue` attribute, if present.
    pub constant_value: Option<u16>,
}

#[derive(Debug)]
pub struct ParsedMethod {
    pub flags: AccessFlags,
    pub name: String,
    pub descriptor: String,
    pub code: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct ParsedClass {
    pub flags: AccessFlags,
    pub name: String,
    pub pool: Vec<PoolEntry>,
    pub fields: Vec<ParsedField>,
    pub methods: Vec<ParsedMethod>,
}

impl ParsedClass {
    pub fn entry(&self, index: u16) -> Result<&PoolEntry, ClassFileError> {
        self.pool
            .get(index as usize)
            .ok_or(ClassFileError::BadPoolIndex(index))
    }

    pub fn utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.entry(index)? {
            PoolEntry::Utf8(bytes) => {
                core::str::from_utf8(bytes).map_err(|_| ClassFileError::BadUtf8)
            }
            _ => Err(ClassFileError::BadPoolIndex(index)),
        }
    }
}

fn utf8_of(pool: &[PoolEntry], index: u16) -> Result<&str, ClassFileError> {
    match pool.get(index as usize) {
        Some(PoolEntry::Utf8(bytes)) => {
            core::str::from_utf8(bytes).map_err(|_| ClassFileError::BadUtf8)
        }
        _ => Err(ClassFileError::BadPoolIndex(index)),
    }
}

fn parse_pool(r: &mut Reader) -> Result<Vec<PoolEntry>, ClassFileError> {
    let count = r.read2()? as usize;
    let mut pool = vec![PoolEntry::Empty; count.max(1)];
    let mut i = 1;
    while i < count {
        let tag = r.read1()?;
        pool[i] = match tag {
            pool_tag::UTF8 => {
                let len = r.read2()? as usize;
                PoolEntry::Utf8(r.take(len)?.to_vec())
            }
            pool_tag::INTEGER => PoolEntry::Integer(r.read4()? as i32),
            pool_tag::FLOAT => PoolEntry::Float(f32::from_bits(r.read4()?)),
            pool_tag::LONG => PoolEntry::Long(r.read8()? as i64),
            pool_tag::DOUBLE => PoolEntry::Double(f64::from_bits(r.read8()?)),
            pool_tag::CLASS => PoolEntry::ClassRef(r.read2()?),
            pool_tag::STRING => PoolEntry::StringRef(r.read2()?),
            pool_tag::FIELDREF => PoolEntry::FieldRef(r.read2()?, r.read2()?),
            pool_tag::METHODREF => PoolEntry::MethodRef(r.read2()?, r.read2()?),
            pool_tag::INTERFACE_METHODREF => {
                PoolEntry::InterfaceMethodRef(r.read2()?, r.read2()?)
            }
            pool_tag::NAME_AND_TYPE => {
                PoolEntry::NameAndType(r.read2()?, r.read2()?)
            }
            other => return Err(ClassFileError::UnknownPoolTag(other)),
        };
        // Long and Double occupy two slots.
        i += match tag {
            pool_tag::LONG | pool_tag::DOUBLE => 2,
            _ => 1,
        };
    }
    Ok(pool)
}

/// Parse a mapped `.class` region down to the pieces class resolution needs:
/// the constant pool, the field table (with `ConstantValue` indices), and the
/// method table (with `Code` bodies).
pub fn parse(bytes: &[u8]) -> Result<ParsedClass, ClassFileError> {
    let mut r = Reader::new(bytes);

    let magic = r.read4()?;
    if magic != CLASS_MAGIC {
        return Err(ClassFileError::BadMagic(magic));
    }
    r.read2()?; // minor version
    r.read2()?; // major version

    let pool = parse_pool(&mut r)?;

    let flags = AccessFlags::from_bits_truncate(r.read2()?);
    let this_class = r.read2()?;
    r.read2()?; // super class
    let interface_count = r.read2()? as usize;
    r.skip(interface_count * 2)?;

    let name = match pool.get(this_class as usize) {
        Some(PoolEntry::ClassRef(idx)) => utf8_of(&pool, *idx)?.to_string(),
        _ => return Err(ClassFileError::BadPoolIndex(this_class)),
    };

    let field_count = r.read2()? as usize;
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        let flags = AccessFlags::from_bits_truncate(r.read2()?);
        let name = utf8_of(&pool, r.read2()?)?.to_string();
        let descriptor = utf8_of(&pool, r.read2()?)?.to_string();
        let mut constant_value = None;
        let attr_count = r.read2()? as usize;
        for _ in 0..attr_count {
            let attr_name = utf8_of(&pool, r.read2()?)?;
            let len = r.read4()? as usize;
            if attr_name == "ConstantValue" && len == 2 {
                constant_value = Some(r.read2()?);
            } else {
                r.skip(len)?;
            }
        }
        fields.push(ParsedField { flags, name, descriptor, constant_value });
    }

    let method_count = r.read2()? as usize;
    let mut methods = Vec::with_capacity(method_count);
    for _ in 0..method_count {
        let flags = AccessFlags::from_bits_truncate(r.read2()?);
        let name = utf8_of(&pool, r.read2()?)?.to_string();
        let descriptor = utf8_of(&pool, r.read2()?)?.to_string();
        let mut code = None;
        let attr_count = r.read2()? as usize;
        for _ in 0..attr_count {
            let attr_name = utf8_of(&pool, r.read2()?)?;
            let len = r.read4()? as usize;
            if attr_name == "Code" {
                let end = r.pos + len;
                r.read2()?; // max stack
                r.read2()?; // max locals
                let code_len = r.read4()? as usize;
                code = Some(r.take(code_len)?.to_vec());
                r.skip(end - r.pos)?;
            } else {
                r.skip(len)?;
            }
        }
        methods.push(ParsedMethod { flags, name, descriptor, code });
    }

    Ok(ParsedClass { flags, name, pool, fields, methods })
}

/// Source field codes recognized by the layout machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldCode {
    Object = 1,
    Byte,
    Boolean,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
}

impl FieldCode {
    pub fn from_descriptor(desc: &str) -> Result<Self, ClassFileError> {
        let first = desc
            .chars()
            .next()
            .ok_or(ClassFileError::UnsupportedFieldCode(' '))?;
        Ok(match first {
            'B' => FieldCode::Byte,
            'Z' => FieldCode::Boolean,
            'C' => FieldCode::Char,
            'S' => FieldCode::Short,
            'I' => FieldCode::Int,
            'F' => FieldCode::Float,
            'J' => FieldCode::Long,
            'D' => FieldCode::Double,
            'L' | '[' => FieldCode::Object,
            other => return Err(ClassFileError::UnsupportedFieldCode(other)),
        })
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            1 => FieldCode::Object,
            2 => FieldCode::Byte,
            3 => FieldCode::Boolean,
            4 => FieldCode::Char,
            5 => FieldCode::Short,
            6 => FieldCode::Int,
            7 => FieldCode::Float,
            8 => FieldCode::Long,
            9 => FieldCode::Double,
            _ => return None,
        })
    }

    /// Build-side storage size of a field of this code.
    pub fn size(self, abi: Abi) -> usize {
        match self {
            FieldCode::Object => abi.word_bytes(),
            FieldCode::Byte | FieldCode::Boolean => 1,
            FieldCode::Char | FieldCode::Short => 2,
            FieldCode::Int | FieldCode::Float => 4,
            FieldCode::Long | FieldCode::Double => 8,
        }
    }
}
