//! The host-side VM the boot image writer consumes: a build-layout object
//! arena, the internal type catalog, class-file resolution, a baseline
//! compiler, and the visitor-driven heap walk.

pub mod classfile;
pub mod finder;
pub mod heap;
pub mod machine;
pub mod processor;
pub mod testutil;
pub mod types;
pub mod walk;

pub use classfile::{AccessFlags, ClassFileError, FieldCode};
pub use finder::Classpath;
pub use heap::{Heap, HostObject, Ref};
pub use machine::{Machine, PRIMITIVE_FLAG, PRIMITIVE_NAMES};
pub use processor::{
    ConstantSite, DeferredAddress, DeferredCall, HeapConstant, Processor,
    Thunks,
};
pub use types::{layout, ArrayTail, Layout, Type, VmType};
pub use walk::{HeapVisitor, HeapWalker};
