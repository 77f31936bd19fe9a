//! End-to-end: synthesize a classpath, write an image, and read the emitted
//! bytes back section by section.

use abi::{Abi, Endian, WordSize};
use bootimage::serialize::{section_offsets, SectionOffsets, HEADER_WORDS};
use bootimage::{write_boot_image, Filters, ImageHeader, WriteConfig, MAGIC};
use runtime::testutil::ClassBuilder;
use runtime::{AccessFlags, Classpath, Machine, Thunks};

const LE64: Abi = Abi { word: WordSize::W64, endian: Endian::Little };
const BE64: Abi = Abi { word: WordSize::W64, endian: Endian::Big };

/// Reader over an emitted image.
struct Image {
    target: Abi,
    bytes: Vec<u8>,
    header: ImageHeader,
    sections: SectionOffsets,
}

impl Image {
    fn parse(bytes: Vec<u8>, target: Abi) -> Self {
        let w = target.word_bytes();
        assert!(bytes.len() >= HEADER_WORDS * w, "truncated header");
        let word = |i: usize| target.get_word(&bytes[i * w..]);

        assert_eq!(word(0), MAGIC as u64, "bad image magic");
        let header = ImageHeader {
            code_base: word(1),
            heap_size: word(2),
            code_size: word(3),
            boot_class_count: word(4) as u32,
            app_class_count: word(5) as u32,
            string_count: word(6) as u32,
            call_count: word(7) as u32,
            boot_loader: word(8) as u32,
            app_loader: word(9) as u32,
            types: word(10) as u32,
            thunks: Thunks {
                default_start: word(11) as u32,
                default_size: word(12) as u32,
                native_start: word(13) as u32,
                native_size: word(14) as u32,
                table_start: word(15) as u32,
                table_size: word(16) as u32,
            },
        };
        let sections = section_offsets(target, &header);
        assert_eq!(bytes.len(), sections.end, "trailing bytes");
        Self { target, bytes, header, sections }
    }

    fn heap_words(&self) -> usize {
        self.header.heap_size as usize / self.target.word_bytes()
    }

    fn heap_word(&self, index: usize) -> u64 {
        let at = self.sections.heap + index * self.target.word_bytes();
        self.target.get_word(&self.bytes[at..])
    }

    fn heap_bit(&self, index: usize) -> bool {
        let bits = self.target.bits_per_word();
        let at = self.sections.heap_map
            + (index / bits) * self.target.word_bytes();
        let word = self.target.get_word(&self.bytes[at..]);
        word & (1 << (index % bits)) != 0
    }

    fn code_bit(&self, byte_index: usize) -> bool {
        let bits = self.target.bits_per_word();
        let at = self.sections.code_map
            + (byte_index / bits) * self.target.word_bytes();
        let word = self.target.get_word(&self.bytes[at..]);
        word & (1 << (byte_index % bits)) != 0
    }

    fn code_word(&self, byte_offset: usize) -> u64 {
        self.target
            .get_word(&self.bytes[self.sections.code + byte_offset..])
    }

    fn table_entry(&self, index: usize) -> u32 {
        self.target.get32(&self.bytes[self.sections.tables + index * 4..])
    }
}

fn write(classes: &[(&str, Vec<u8>)], target: Abi) -> Image {
    write_with(classes, WriteConfig::new(target))
}

fn write_with(classes: &[(&str, Vec<u8>)], config: WriteConfig) -> Image {
    let classpath = Classpath::from_entries(
        classes
            .iter()
            .map(|(n, b)| (format!("{n}.class"), b.clone()))
            .collect(),
    );
    let mut machine = Machine::bootstrap(LE64);
    let mut out = Vec::new();
    let summary = write_boot_image(&mut machine, &classpath, &mut out, &config)
        .expect("write image");
    let image = Image::parse(out, config.target);
    assert_eq!(image.header.heap_size, summary.heap_size);
    image
}

fn assert_heap_bitmap_fidelity(image: &Image) {
    for i in 0..image.heap_words() {
        if image.heap_bit(i) {
            assert_ne!(image.heap_word(i), 0, "marked slot {i} is zero");
        }
    }
}

#[test]
fn smallest_image_holds_only_primitive_classes() {
    let image = write(&[], LE64);
    assert_eq!(image.header.boot_class_count, 9);
    assert_eq!(image.header.app_class_count, 0);
    assert_eq!(image.header.string_count, 0);
    assert_eq!(image.header.call_count, 0);
    assert!(image.header.heap_size > 0);
    assert_eq!(image.header.code_size, 0);
    // With nothing compiled there are no thunks either.
    assert_eq!(image.header.thunks.native_size, 0);
    assert_heap_bitmap_fidelity(&image);
}

#[test]
fn boot_table_entries_are_live_numbers() {
    let bytes = ClassBuilder::new("A")
        .field(AccessFlags::empty(), "x", "I")
        .build();
    let image = write(&[("A", bytes)], LE64);
    assert_eq!(image.header.boot_class_count, 10);

    for i in 0..image.header.boot_class_count as usize {
        let number = image.table_entry(i);
        assert!(number > 0, "boot class {i} missing from the heap");
        assert!((number as usize) <= image.heap_words());
        // Each entry's class slot refers to the class-of-classes.
        assert_ne!(image.heap_word(number as usize - 1), 0);
    }
    assert_heap_bitmap_fidelity(&image);
}

#[test]
fn root_numbers_land_in_the_header() {
    let image = write(&[], LE64);
    for number in [
        image.header.boot_loader,
        image.header.app_loader,
        image.header.types,
    ] {
        assert!(number > 0);
        assert!((number as usize) <= image.heap_words());
    }
    // Loaders are fixed objects: their class slots carry relocated mark bits.
    let boot = image.heap_word(image.header.boot_loader as usize - 1);
    assert_eq!(boot >> LE64.boot_shift(), 1);
}

#[test]
fn compiled_methods_produce_code_and_tables() {
    let mut cb = ClassBuilder::new("M");
    let idx = cb.add_string("pinned");
    cb.method(AccessFlags::PUBLIC, "run", "()V", &[0x12, idx as u8, 0xB1]);
    let image = write(&[("M", cb.build())], LE64);

    assert_eq!(image.header.call_count, 1);
    assert!(image.header.string_count >= 1);
    assert!(image.header.code_size > 0);
    assert_eq!(image.header.thunks.native_start, 8);
    assert_eq!(image.header.thunks.native_size, 8);

    // Call-table pair: live method number, blob offset past the thunks.
    let base = (image.header.boot_class_count
        + image.header.app_class_count
        + image.header.string_count) as usize;
    let method_number = image.table_entry(base);
    let blob_offset = image.table_entry(base + 1);
    assert!(method_number > 0);
    assert_eq!(blob_offset, 24);

    // Blob layout: call immediate, address immediate, bytecode, constant
    // immediate.
    assert_eq!(image.code_word(24), image.header.code_base + 24);
    assert!(!image.code_bit(24));

    assert_eq!(image.code_word(32), 40);
    assert!(image.code_bit(32));

    let bytecode_at = image.sections.code + 40;
    assert_eq!(image.bytes[bytecode_at], 0x12);

    let constant_at = 43;
    assert!(image.code_bit(constant_at));
    let value = image.code_word(constant_at);
    assert_ne!(value & LE64.boot_heap_offset(), 0);
    let number = value & !(LE64.boot_heap_offset() | LE64.boot_flat_constant());
    assert!(number > 0);
    assert!((number as usize) <= image.heap_words());

    // The string-table entry points at the same interned string.
    let string_number =
        image.table_entry(image.header.boot_class_count as usize) as u64;
    assert_eq!(string_number, number);

    assert_heap_bitmap_fidelity(&image);
}

#[test]
fn native_methods_route_through_the_native_thunk() {
    let bytes = ClassBuilder::new("N")
        .native_method(AccessFlags::NATIVE, "n", "()V")
        .build();
    let image = write(&[("N", bytes)], LE64);

    assert_eq!(image.header.call_count, 0);
    // Stub immediate resolves to code_base + native thunk start.
    let stub = image.code_word(24);
    assert_eq!(
        stub,
        image.header.code_base + image.header.thunks.native_start as u64
    );
}

#[test]
fn class_filter_reduces_the_image() {
    let a = ClassBuilder::new("A").build();
    let b = ClassBuilder::new("B").build();
    let mut config = WriteConfig::new(LE64);
    config.filters = Filters {
        class_name: Some("A".to_string()),
        ..Filters::default()
    };
    let image = write_with(&[("A", a), ("B", b)], config);
    assert_eq!(image.header.boot_class_count, 10);
}

#[test]
fn static_string_constants_are_interned_and_reachable() {
    let mut cb = ClassBuilder::new("S");
    let v = cb.add_string("greeting");
    let bytes = cb
        .field_with_constant(
            AccessFlags::STATIC,
            "msg",
            "Ljava/lang/String;",
            v,
        )
        .build();
    let image = write(&[("S", bytes)], LE64);

    assert_eq!(image.header.string_count, 1);
    let string_number =
        image.table_entry(image.header.boot_class_count as usize);
    assert!(string_number > 0);
    assert_heap_bitmap_fidelity(&image);
}

#[test]
fn big_endian_images_parse_with_big_endian_words() {
    let bytes = ClassBuilder::new("E")
        .field(AccessFlags::empty(), "x", "I")
        .build();
    let image = write(&[("E", bytes)], BE64);
    assert_eq!(image.header.boot_class_count, 10);
    assert!(image.header.heap_size > 0);
    assert_heap_bitmap_fidelity(&image);
}

#[test]
fn wide_target_from_narrow_build() {
    let bytes = ClassBuilder::new("W")
        .field(AccessFlags::empty(), "a", "I")
        .field(AccessFlags::empty(), "b", "J")
        .build();
    let classpath =
        Classpath::from_entries(vec![("W.class".to_string(), bytes)]);
    let build32 = Abi { word: WordSize::W32, endian: Endian::Little };
    let mut machine = Machine::bootstrap(build32);
    let mut out = Vec::new();
    write_boot_image(&mut machine, &classpath, &mut out, &WriteConfig::new(LE64))
        .expect("write");
    let image = Image::parse(out, LE64);
    assert_eq!(image.header.boot_class_count, 10);
    assert_heap_bitmap_fidelity(&image);
}

#[test]
fn debug_native_target_round_trips() {
    let mut cb = ClassBuilder::new("R");
    let v = cb.add_string("value");
    let bytes = cb
        .field_with_constant(
            AccessFlags::STATIC,
            "s",
            "Ljava/lang/String;",
            v,
        )
        .build();
    let mut config = WriteConfig::new(LE64);
    config.debug_native_target = true;
    // Build ABI == target ABI: every emitted object must equal its source
    // field-for-field, or the writer aborts.
    let image = write_with(&[("R", bytes)], config);
    assert!(image.header.heap_size > 0);
}
