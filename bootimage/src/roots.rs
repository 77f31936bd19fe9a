use runtime::{HeapWalker, Machine, Processor};

use crate::visitor::ImageVisitor;

/// Heap numbers of the roots the header records directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootNumbers {
    pub boot_loader: u32,
    pub app_loader: u32,
    pub types: u32,
}

/// Drive the walk over every root, in order: the boot dictionary's classes,
/// the two loaders, the types array, the compiler's own roots, the heap
/// objects referenced from compiled code, and finally the interned strings.
pub fn visit_roots(
    m: &Machine,
    processor: &Processor,
    walker: &mut HeapWalker,
    visitor: &mut ImageVisitor,
) -> RootNumbers {
    for &class in m.boot_dictionary.values() {
        walker.visit_root(&m.heap, visitor, class);
    }

    let boot_loader = walker.visit_root(&m.heap, visitor, m.boot_loader);
    let app_loader = walker.visit_root(&m.heap, visitor, m.app_loader);
    let types = walker.visit_root(&m.heap, visitor, m.types);

    for method in processor.roots() {
        walker.visit_root(&m.heap, visitor, method);
    }

    for constant in &processor.constants {
        walker.visit_root(&m.heap, visitor, constant.value);
    }

    for &string in m.intern_table.values() {
        walker.visit_root(&m.heap, visitor, string);
    }

    RootNumbers { boot_loader, app_loader, types }
}
