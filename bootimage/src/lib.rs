//! Ahead-of-time boot image writer.
//!
//! Takes a freshly initialized [`runtime::Machine`] — classes resolved from a
//! classpath, compiled method blobs, interned strings, the internal type
//! catalog — and emits one self-contained binary the target VM memory-maps on
//! startup. The pipeline: build per-entity type maps, walk the live object
//! graph into a target-format heap buffer while marking pointer slots,
//! rewrite code-segment immediates, then serialize header, index tables,
//! bitmaps, heap, and code.

pub mod bitmap;
pub mod coderes;
pub mod error;
pub mod layout;
pub mod roots;
pub mod scan;
pub mod serialize;
pub mod transcode;
pub mod typemap;
pub mod visitor;

use std::io::Write;

use abi::Abi;
use log::info;
use runtime::{Classpath, HeapWalker, Machine, Processor, VmType};

pub use crate::error::{Error, Result};
pub use crate::scan::Filters;
pub use crate::serialize::{ImageHeader, MAGIC};

/// Upper bound on the emitted heap, matching the writer's one-shot
/// allocation.
pub const HEAP_CAPACITY: usize = 256 * 1024 * 1024;

/// Upper bound on the code segment; branches with immediate displacements
/// keep this modest.
pub const CODE_CAPACITY: usize = 30 * 1024 * 1024;

/// Where the target VM maps the code segment; stands in for a real load
/// address in the emitted absolute call immediates.
pub const DEFAULT_CODE_BASE: u64 = 0x4000_0000;

/// Everything the writer needs besides the machine and the classpath.
#[derive(Debug, Clone)]
pub struct WriteConfig {
    pub target: Abi,
    pub filters: Filters,
    pub heap_capacity: usize,
    pub code_capacity: usize,
    pub code_base: u64,
    /// Cross-check that the computed target layout equals the host layout;
    /// only sound when building for a same-ABI target.
    pub debug_native_target: bool,
}

impl WriteConfig {
    pub fn new(target: Abi) -> Self {
        Self {
            target,
            filters: Filters::default(),
            heap_capacity: HEAP_CAPACITY,
            code_capacity: CODE_CAPACITY,
            code_base: DEFAULT_CODE_BASE,
            debug_native_target: false,
        }
    }
}

/// What the writer emitted, for logging and tests.
#[derive(Debug, Clone, Copy)]
pub struct ImageSummary {
    pub boot_class_count: u32,
    pub app_class_count: u32,
    pub string_count: u32,
    pub call_count: u32,
    pub heap_size: u64,
    pub code_size: u64,
}

/// Write a complete boot image to `out`.
///
/// Ordering guarantees: every type map is installed before the walk begins;
/// every object is numbered before any edge into it is patched; the
/// code-constant passes run strictly after the walk completes.
pub fn write_boot_image<W: Write>(
    m: &mut Machine,
    classpath: &Classpath,
    out: &mut W,
    config: &WriteConfig,
) -> Result<ImageSummary> {
    let target = config.target;
    let build = m.build_abi();

    let mut processor =
        Processor::new(target, config.code_capacity, config.code_base);
    let mut maps = typemap::TypeMaps::new();

    scan::scan_classes(
        m,
        &mut processor,
        &mut maps,
        classpath,
        &config.filters,
        target,
    )?;

    // Hard-coded descriptors for the VM's internal types; pre-existing
    // same-key entries are replaced.
    for ty in VmType::ALL {
        let map = typemap::descriptor_map(ty.descriptor(), build, target);
        maps.insert(m.type_class(ty), map);
    }

    m.seal();

    let mut walker = HeapWalker::new();
    let mut visitor = visitor::ImageVisitor::new(
        m,
        &maps,
        target,
        config.heap_capacity,
        config.debug_native_target,
    );
    let root_numbers = roots::visit_roots(m, &processor, &mut walker, &mut visitor);
    let heap_size = (visitor.heap.position() * target.word_bytes()) as u64;

    let mut code_map = bitmap::Bitmap::new(target);
    coderes::resolve_calls(
        m,
        &processor.calls,
        &processor.thunks,
        &mut processor.code,
        config.code_base,
        target,
    );
    coderes::resolve_addresses(
        &processor.addresses,
        &mut processor.code,
        &mut code_map,
        config.code_base,
        target,
    );
    coderes::resolve_heap_constants(
        &processor.constants,
        &walker,
        &mut processor.code,
        &mut code_map,
        target,
    );

    let boot_table: Vec<u32> =
        m.boot_dictionary.values().map(|&c| walker.number(c)).collect();
    let app_table: Vec<u32> =
        m.app_dictionary.values().map(|&c| walker.number(c)).collect();
    let string_table: Vec<u32> =
        m.intern_table.values().map(|&s| walker.number(s)).collect();
    let call_table: Vec<(u32, u32)> = processor
        .call_table
        .iter()
        .map(|&(method, offset)| (walker.number(method), offset))
        .collect();

    let header = ImageHeader {
        code_base: config.code_base,
        heap_size,
        code_size: processor.code_size() as u64,
        boot_class_count: boot_table.len() as u32,
        app_class_count: app_table.len() as u32,
        string_count: string_table.len() as u32,
        call_count: call_table.len() as u32,
        boot_loader: root_numbers.boot_loader,
        app_loader: root_numbers.app_loader,
        types: root_numbers.types,
        thunks: processor.thunks,
    };

    info!(
        "class count {} string count {} call count {}",
        header.boot_class_count, header.string_count, header.call_count
    );
    info!("heap size {} code size {}", header.heap_size, header.code_size);

    serialize::write_image(
        out,
        target,
        &header,
        &boot_table,
        &app_table,
        &string_table,
        &call_table,
        &visitor.heap_map,
        &visitor.heap,
        &code_map,
        &processor.code,
    )?;

    Ok(ImageSummary {
        boot_class_count: header.boot_class_count,
        app_class_count: header.app_class_count,
        string_count: header.string_count,
        call_count: header.call_count,
        heap_size: header.heap_size,
        code_size: header.code_size,
    })
}
