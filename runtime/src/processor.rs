use abi::Abi;
use log::debug;

use crate::classfile::AccessFlags;
use crate::heap::Ref;
use crate::machine::Machine;

/// Code-segment regions holding the shared thunk stubs, as
/// `(start, size)` byte offsets from the code base.
#[derive(Debug, Clone, Copy, Default)]
pub struct Thunks {
    pub default_start: u32,
    pub default_size: u32,
    pub native_start: u32,
    pub native_size: u32,
    pub table_start: u32,
    pub table_size: u32,
}

/// One patch site awaiting a heap-constant immediate.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSite {
    /// Byte offset of the target-word immediate within the code segment.
    pub location: u32,
    pub flat: bool,
}

/// A heap object referenced from compiled code, with every site that needs
/// its image number patched in.
#[derive(Debug)]
pub struct HeapConstant {
    pub value: Ref,
    pub sites: Vec<ConstantSite>,
}

/// A call immediate awaiting a method address.
#[derive(Debug, Clone, Copy)]
pub struct DeferredCall {
    pub method: Ref,
    /// Byte offset of the immediate within the code segment.
    pub site: u32,
}

/// An intra-code address immediate awaiting rebasing.
#[derive(Debug, Clone, Copy)]
pub struct DeferredAddress {
    /// Byte offset whose final address is the value to store.
    pub basis: u32,
    /// Byte offset of the immediate to patch.
    pub site: u32,
    pub flat: bool,
}

const THUNK_FILL: u8 = 0xCC;

/// The baseline compiler. Blobs are opaque to the writer; what matters is
/// the deferred-immediate bookkeeping: every compiled method contributes one
/// call immediate (its own entry) and one address immediate (its bytecode
/// start), and each `ldc` of an object pool entry contributes a heap-constant
/// site.
pub struct Processor {
    target: Abi,
    capacity: usize,
    code_base: u64,
    pub code: Vec<u8>,
    pub thunks: Thunks,
    pub constants: Vec<HeapConstant>,
    pub calls: Vec<DeferredCall>,
    pub addresses: Vec<DeferredAddress>,
    /// `(method, blob byte offset)` per compiled method, in compile order.
    pub call_table: Vec<(Ref, u32)>,
}

impl Processor {
    pub fn new(target: Abi, capacity: usize, code_base: u64) -> Self {
        Self {
            target,
            capacity,
            code_base,
            code: Vec::new(),
            thunks: Thunks::default(),
            constants: Vec::new(),
            calls: Vec::new(),
            addresses: Vec::new(),
            call_table: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn code_base(&self) -> u64 {
        self.code_base
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Thunk stubs are emitted lazily so an image with no compiled methods
    /// has an empty code segment.
    fn ensure_thunks(&mut self) {
        if !self.code.is_empty() {
            return;
        }
        let word = self.target.word_bytes() as u32;
        self.thunks = Thunks {
            default_start: 0,
            default_size: word,
            native_start: word,
            native_size: word,
            table_start: 2 * word,
            table_size: word,
        };
        self.code.extend(std::iter::repeat(THUNK_FILL).take(3 * word as usize));
    }

    fn emit_word(&mut self) -> u32 {
        let site = self.code.len() as u32;
        self.code.extend(std::iter::repeat(0).take(self.target.word_bytes()));
        site
    }

    fn check_capacity(&self) {
        assert!(
            self.code.len() <= self.capacity,
            "code capacity exceeded: {} > {}",
            self.code.len(),
            self.capacity
        );
    }

    /// Compile one method into the code segment, recording its deferred
    /// constants, call, and address entries. Methods without bytecode are
    /// compiled only when native (a one-word stub routed through the native
    /// thunk).
    pub fn compile_method(&mut self, m: &mut Machine, method: Ref) {
        let flags = m.method_flags(method);

        if flags.contains(AccessFlags::NATIVE) {
            self.ensure_thunks();
            let site = self.emit_word();
            self.calls.push(DeferredCall { method, site });
            self.check_capacity();
            return;
        }

        let code = m.method_code(method);
        if code.is_null() {
            return;
        }

        self.ensure_thunks();
        let word = self.target.word_bytes() as u32;
        let entry = self.code.len() as u32;

        let call_site = self.emit_word();
        self.calls.push(DeferredCall { method, site: call_site });

        let addr_site = self.emit_word();
        self.addresses.push(DeferredAddress {
            basis: entry + 2 * word,
            site: addr_site,
            flat: false,
        });

        let bytecode = m.code_bytes(code).to_vec();
        let loads = scan_constant_loads(&bytecode);
        self.code.extend_from_slice(&bytecode);

        let pool = m.code_pool(code);
        if !pool.is_null() {
            for index in loads {
                if index == 0 {
                    continue;
                }
                let slot = 2 + index as u32 - 1;
                if !m.heap.object(pool).refs.contains(&slot) {
                    continue;
                }
                let value = m.heap.get_ref(pool, slot);
                if value.is_null() {
                    continue;
                }
                let location = self.emit_word();
                let site = ConstantSite { location, flat: false };
                match self.constants.iter_mut().find(|c| c.value == value) {
                    Some(c) => c.sites.push(site),
                    None => self.constants.push(HeapConstant {
                        value,
                        sites: vec![site],
                    }),
                }
            }
        }

        m.set_code_compiled(code, self.code_base + entry as u64);
        self.call_table.push((method, entry));
        self.check_capacity();
        debug!(
            "compiled method at {entry:#x}, {} bytes of bytecode",
            bytecode.len()
        );
    }

    /// Heap objects the compiler itself keeps alive.
    pub fn roots(&self) -> impl Iterator<Item = Ref> + '_ {
        self.call_table.iter().map(|&(method, _)| method)
    }
}

/// Pull the pool indices of `ldc`/`ldc_w` instructions out of a bytecode
/// stream. Only the common fixed-length opcodes are recognized; the scan
/// stops at the first unknown or variable-length opcode and treats the rest
/// of the stream as opaque.
fn scan_constant_loads(bytecode: &[u8]) -> Vec<u16> {
    let mut loads = Vec::new();
    let mut i = 0;
    while i < bytecode.len() {
        let op = bytecode[i];
        let operands = match op {
            0x00..=0x0F => 0,
            0x10 => 1,
            0x11 => 2,
            // ldc
            0x12 => {
                if i + 1 >= bytecode.len() {
                    break;
                }
                loads.push(bytecode[i + 1] as u16);
                1
            }
            // ldc_w
            0x13 => {
                if i + 2 >= bytecode.len() {
                    break;
                }
                loads.push(((bytecode[i + 1] as u16) << 8) | bytecode[i + 2] as u16);
                2
            }
            // ldc2_w loads a long or double — never an object
            0x14 => 2,
            0x15..=0x19 => 1,
            0x1A..=0x35 => 0,
            0x36..=0x3A => 1,
            0x3B..=0x83 => 0,
            0x84 => 2,
            0x99..=0xA8 => 2,
            0xAC..=0xB1 => 0,
            0xB2..=0xB8 => 2,
            0xB9 | 0xBA => 4,
            0xBB => 2,
            0xBC => 1,
            0xBD => 2,
            0xBE | 0xBF => 0,
            0xC0 | 0xC1 => 2,
            0xC2 | 0xC3 => 0,
            0xC6 | 0xC7 => 2,
            _ => break,
        };
        if i + 1 + operands > bytecode.len() {
            break;
        }
        i += 1 + operands;
    }
    loads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ClassBuilder;
    use abi::{Endian, WordSize};

    const ABI: Abi = Abi { word: WordSize::W64, endian: Endian::Little };

    fn first_method(m: &Machine, class: Ref) -> Ref {
        let table = m.class_method_table(class);
        m.array_element(table, 0)
    }

    #[test]
    fn no_methods_means_no_code() {
        let p = Processor::new(ABI, 1 << 20, 0x4000_0000);
        assert_eq!(p.code_size(), 0);
        assert_eq!(p.thunks.native_size, 0);
    }

    #[test]
    fn compiling_emits_thunks_and_defers_immediates() {
        let mut m = Machine::bootstrap(ABI);
        let mut cb = ClassBuilder::new("C");
        let idx = cb.add_string("hello");
        cb.method(
            AccessFlags::PUBLIC,
            "f",
            "()V",
            &[0x12, idx as u8, 0xB1],
        );
        let bytes = cb.build();
        let class = m.resolve_system_class("C", &bytes).expect("resolve");

        let mut p = Processor::new(ABI, 1 << 20, 0x4000_0000);
        let method = first_method(&m, class);
        p.compile_method(&mut m, method);

        assert_eq!(p.thunks.native_start, 8);
        assert_eq!(p.call_table.len(), 1);
        assert_eq!(p.calls.len(), 1);
        assert_eq!(p.addresses.len(), 1);
        assert_eq!(p.constants.len(), 1);
        let hello = *m.intern_table.get("hello").expect("interned");
        assert_eq!(p.constants[0].value, hello);

        let code = m.method_code(method);
        assert_eq!(m.code_compiled(code), 0x4000_0000 + 24);
    }

    #[test]
    fn native_methods_become_thunk_stubs() {
        let mut m = Machine::bootstrap(ABI);
        let bytes = ClassBuilder::new("N")
            .native_method(AccessFlags::NATIVE, "n", "()V")
            .build();
        let class = m.resolve_system_class("N", &bytes).expect("resolve");

        let mut p = Processor::new(ABI, 1 << 20, 0x4000_0000);
        let method = first_method(&m, class);
        p.compile_method(&mut m, method);

        assert_eq!(p.calls.len(), 1);
        assert!(p.call_table.is_empty());
        assert_eq!(p.code_size(), 4 * 8);
    }

    #[test]
    fn constant_load_scan_reads_both_ldc_forms() {
        let loads = scan_constant_loads(&[
            0x03, // iconst_0
            0x12, 0x07, // ldc 7
            0x13, 0x01, 0x02, // ldc_w 0x0102
            0xB1, // return
        ]);
        assert_eq!(loads, vec![7, 0x0102]);
    }

    #[test]
    fn constant_load_scan_stops_at_unknown_opcodes() {
        let loads = scan_constant_loads(&[0xAA, 0x12, 0x07]);
        assert!(loads.is_empty());
    }
}
