//! Class-file synthesis for tests.

use crate::classfile::{pool_tag, AccessFlags};

/// Builds a minimal, well-formed `.class` byte image: a constant pool, a
/// field table (optionally with `ConstantValue` attributes), and a method
/// table (optionally with `Code` bodies).
pub struct ClassBuilder {
    pool: Vec<Vec<u8>>,
    next_index: u16,
    this_class: u16,
    super_class: u16,
    flags: AccessFlags,
    fields: Vec<Vec<u8>>,
    methods: Vec<Vec<u8>>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        let mut b = Self {
            pool: Vec::new(),
            next_index: 1,
            this_class: 0,
            super_class: 0,
            flags: AccessFlags::PUBLIC | AccessFlags::SUPER,
            fields: Vec::new(),
            methods: Vec::new(),
        };
        b.this_class = b.add_class(name);
        b.super_class = b.add_class("java/lang/Object");
        b
    }

    // ── pool construction ──────────────────────────────────────────

    fn push_entry(&mut self, bytes: Vec<u8>, wide: bool) -> u16 {
        if let Some(pos) = self.pool.iter().position(|e| *e == bytes) {
            // Recompute the index of the duplicate.
            let mut index = 1;
            for e in &self.pool[..pos] {
                index += if e[0] == pool_tag::LONG || e[0] == pool_tag::DOUBLE {
                    2
                } else {
                    1
                };
            }
            return index;
        }
        let index = self.next_index;
        self.next_index += if wide { 2 } else { 1 };
        self.pool.push(bytes);
        index
    }

    pub fn add_utf8(&mut self, s: &str) -> u16 {
        let mut bytes = vec![pool_tag::UTF8];
        bytes.extend((s.len() as u16).to_be_bytes());
        bytes.extend(s.as_bytes());
        self.push_entry(bytes, false)
    }

    pub fn add_class(&mut self, name: &str) -> u16 {
        let name_idx = self.add_utf8(name);
        let mut bytes = vec![pool_tag::CLASS];
        bytes.extend(name_idx.to_be_bytes());
        self.push_entry(bytes, false)
    }

    pub fn add_string(&mut self, s: &str) -> u16 {
        let utf8 = self.add_utf8(s);
        let mut bytes = vec![pool_tag::STRING];
        bytes.extend(utf8.to_be_bytes());
        self.push_entry(bytes, false)
    }

    pub fn add_integer(&mut self, v: i32) -> u16 {
        let mut bytes = vec![pool_tag::INTEGER];
        bytes.extend((v as u32).to_be_bytes());
        self.push_entry(bytes, false)
    }

    pub fn add_long(&mut self, v: i64) -> u16 {
        let mut bytes = vec![pool_tag::LONG];
        bytes.extend((v as u64).to_be_bytes());
        self.push_entry(bytes, true)
    }

    /// Chaining form of [`add_long`](Self::add_long) for tests that only
    /// need the entry to exist.
    pub fn pool_long(mut self, v: i64) -> Self {
        self.add_long(v);
        self
    }

    // ── members ────────────────────────────────────────────────────

    pub fn field(mut self, flags: AccessFlags, name: &str, descriptor: &str) -> Self {
        self.push_field(flags, name, descriptor, None);
        self
    }

    /// A static field initialized from a `ConstantValue` attribute.
    pub fn field_with_constant(
        mut self,
        flags: AccessFlags,
        name: &str,
        descriptor: &str,
        constant: u16,
    ) -> Self {
        self.push_field(flags, name, descriptor, Some(constant));
        self
    }

    fn push_field(
        &mut self,
        flags: AccessFlags,
        name: &str,
        descriptor: &str,
        constant: Option<u16>,
    ) {
        let name_idx = self.add_utf8(name);
        let desc_idx = self.add_utf8(descriptor);
        let mut bytes = Vec::new();
        bytes.extend(flags.bits().to_be_bytes());
        bytes.extend(name_idx.to_be_bytes());
        bytes.extend(desc_idx.to_be_bytes());
        match constant {
            Some(value_idx) => {
                let attr_name = self.add_utf8("ConstantValue");
                bytes.extend(1u16.to_be_bytes());
                bytes.extend(attr_name.to_be_bytes());
                bytes.extend(2u32.to_be_bytes());
                bytes.extend(value_idx.to_be_bytes());
            }
            None => bytes.extend(0u16.to_be_bytes()),
        }
        self.fields.push(bytes);
    }

    pub fn method(
        &mut self,
        flags: AccessFlags,
        name: &str,
        descriptor: &str,
        code: &[u8],
    ) -> &mut Self {
        let name_idx = self.add_utf8(name);
        let desc_idx = self.add_utf8(descriptor);
        let attr_name = self.add_utf8("Code");
        let mut bytes = Vec::new();
        bytes.extend(flags.bits().to_be_bytes());
        bytes.extend(name_idx.to_be_bytes());
        bytes.extend(desc_idx.to_be_bytes());
        bytes.extend(1u16.to_be_bytes());
        bytes.extend(attr_name.to_be_bytes());
        bytes.extend((12 + code.len() as u32).to_be_bytes());
        bytes.extend(4u16.to_be_bytes()); // max stack
        bytes.extend(4u16.to_be_bytes()); // max locals
        bytes.extend((code.len() as u32).to_be_bytes());
        bytes.extend(code);
        bytes.extend(0u16.to_be_bytes()); // exception table
        bytes.extend(0u16.to_be_bytes()); // code attributes
        self.methods.push(bytes);
        self
    }

    pub fn native_method(
        mut self,
        flags: AccessFlags,
        name: &str,
        descriptor: &str,
    ) -> Self {
        let name_idx = self.add_utf8(name);
        let desc_idx = self.add_utf8(descriptor);
        let mut bytes = Vec::new();
        bytes.extend(flags.bits().to_be_bytes());
        bytes.extend(name_idx.to_be_bytes());
        bytes.extend(desc_idx.to_be_bytes());
        bytes.extend(0u16.to_be_bytes());
        self.methods.push(bytes);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(0xCAFE_BABEu32.to_be_bytes());
        out.extend(0u16.to_be_bytes()); // minor
        out.extend(52u16.to_be_bytes()); // major
        out.extend(self.next_index.to_be_bytes());
        for entry in &self.pool {
            out.extend(entry);
        }
        out.extend(self.flags.bits().to_be_bytes());
        out.extend(self.this_class.to_be_bytes());
        out.extend(self.super_class.to_be_bytes());
        out.extend(0u16.to_be_bytes()); // interfaces
        out.extend((self.fields.len() as u16).to_be_bytes());
        for f in &self.fields {
            out.extend(f);
        }
        out.extend((self.methods.len() as u16).to_be_bytes());
        for m in &self.methods {
            out.extend(m);
        }
        out.extend(0u16.to_be_bytes()); // class attributes
        out
    }
}
