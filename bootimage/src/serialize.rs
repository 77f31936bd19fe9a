use std::io::{self, Write};

use abi::{pad, Abi};
use runtime::Thunks;

use crate::bitmap::Bitmap;
use crate::visitor::HeapBuffer;

/// Identifies a boot image; the first word of the file.
pub const MAGIC: u32 = 0x2237_7711;

/// The fixed-size header record. Every field is written as one target-endian
/// word of target width; set last, written first.
#[derive(Debug, Default)]
pub struct ImageHeader {
    pub code_base: u64,
    /// Heap image size in bytes.
    pub heap_size: u64,
    /// Code segment size in bytes.
    pub code_size: u64,
    pub boot_class_count: u32,
    pub app_class_count: u32,
    pub string_count: u32,
    pub call_count: u32,
    pub boot_loader: u32,
    pub app_loader: u32,
    pub types: u32,
    pub thunks: Thunks,
}

fn write_word<W: Write>(w: &mut W, target: Abi, v: u64) -> io::Result<()> {
    let mut buf = [0u8; 8];
    target.put_word(&mut buf, v);
    w.write_all(&buf[..target.word_bytes()])
}

fn write_u32<W: Write>(w: &mut W, target: Abi, v: u32) -> io::Result<()> {
    let mut buf = [0u8; 4];
    target.put32(&mut buf, v);
    w.write_all(&buf)
}

fn write_zeros<W: Write>(w: &mut W, n: usize) -> io::Result<()> {
    const ZERO: [u8; 16] = [0; 16];
    let mut left = n;
    while left > 0 {
        let chunk = left.min(ZERO.len());
        w.write_all(&ZERO[..chunk])?;
        left -= chunk;
    }
    Ok(())
}

fn write_bitmap<W: Write>(
    w: &mut W,
    target: Abi,
    map: &Bitmap,
    bit_count: usize,
) -> io::Result<()> {
    for i in 0..map.words_for(bit_count) {
        write_word(w, target, map.word(i))?;
    }
    Ok(())
}

/// Emit the image: header, index tables, zero padding to a target word, heap
/// bitmap, heap, code bitmap, code — each section padded to a word.
#[allow(clippy::too_many_arguments)]
pub fn write_image<W: Write>(
    out: &mut W,
    target: Abi,
    header: &ImageHeader,
    boot_table: &[u32],
    app_table: &[u32],
    string_table: &[u32],
    call_table: &[(u32, u32)],
    heap_map: &Bitmap,
    heap: &HeapBuffer,
    code_map: &Bitmap,
    code: &[u8],
) -> io::Result<()> {
    let word = target.word_bytes();

    write_word(out, target, MAGIC as u64)?;
    write_word(out, target, header.code_base)?;
    write_word(out, target, header.heap_size)?;
    write_word(out, target, header.code_size)?;
    write_word(out, target, header.boot_class_count as u64)?;
    write_word(out, target, header.app_class_count as u64)?;
    write_word(out, target, header.string_count as u64)?;
    write_word(out, target, header.call_count as u64)?;
    write_word(out, target, header.boot_loader as u64)?;
    write_word(out, target, header.app_loader as u64)?;
    write_word(out, target, header.types as u64)?;
    for (start, size) in [
        (header.thunks.default_start, header.thunks.default_size),
        (header.thunks.native_start, header.thunks.native_size),
        (header.thunks.table_start, header.thunks.table_size),
    ] {
        write_word(out, target, start as u64)?;
        write_word(out, target, size as u64)?;
    }

    for &n in boot_table.iter().chain(app_table).chain(string_table) {
        write_u32(out, target, n)?;
    }
    for &(method, address) in call_table {
        write_u32(out, target, method)?;
        write_u32(out, target, address)?;
    }

    let table_bytes = 4 * (boot_table.len() + app_table.len() + string_table.len())
        + 8 * call_table.len();
    write_zeros(out, pad(table_bytes, word) - table_bytes)?;

    write_bitmap(out, target, heap_map, heap.position())?;

    let heap_bytes = heap.bytes();
    out.write_all(heap_bytes)?;
    write_zeros(out, pad(heap_bytes.len(), word) - heap_bytes.len())?;

    write_bitmap(out, target, code_map, code.len())?;

    out.write_all(code)?;
    write_zeros(out, pad(code.len(), word) - code.len())?;

    out.flush()
}

/// Byte offsets of each image section for a given header — the reader-side
/// contract the tests check against.
#[derive(Debug, Clone, Copy)]
pub struct SectionOffsets {
    pub tables: usize,
    pub heap_map: usize,
    pub heap: usize,
    pub code_map: usize,
    pub code: usize,
    pub end: usize,
}

/// Header word count: eleven scalar fields plus three `(start, size)` thunk
/// descriptors.
pub const HEADER_WORDS: usize = 11 + 6;

pub fn section_offsets(target: Abi, header: &ImageHeader) -> SectionOffsets {
    let word = target.word_bytes();
    let bits = target.bits_per_word();

    let tables = HEADER_WORDS * word;
    let table_bytes = 4
        * (header.boot_class_count
            + header.app_class_count
            + header.string_count) as usize
        + 8 * header.call_count as usize;

    let heap_map = tables + pad(table_bytes, word);
    let heap_words = header.heap_size as usize / word;
    let heap = heap_map + abi::ceiling(heap_words, bits) * word;
    let code_map = heap + pad(header.heap_size as usize, word);
    let code = code_map + abi::ceiling(header.code_size as usize, bits) * word;
    let end = code + pad(header.code_size as usize, word);

    SectionOffsets { tables, heap_map, heap, code_map, code, end }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{Endian, WordSize};

    const BE32: Abi = Abi { word: WordSize::W32, endian: Endian::Big };

    #[test]
    fn sections_are_word_aligned() {
        let mut out = Vec::new();
        let header = ImageHeader {
            code_base: 0x1000,
            heap_size: 8,
            code_size: 3,
            boot_class_count: 1,
            app_class_count: 0,
            string_count: 0,
            call_count: 0,
            ..ImageHeader::default()
        };
        let mut heap = HeapBuffer::new(BE32, 1 << 12);
        heap.set_word(0, 0xAABB);
        heap.set_word(1, 0xCCDD);
        heap.advance(2);
        let heap_map = Bitmap::new(BE32);
        let code_map = Bitmap::new(BE32);

        write_image(
            &mut out,
            BE32,
            &header,
            &[5],
            &[],
            &[],
            &[],
            &heap_map,
            &heap,
            &code_map,
            &[1, 2, 3],
        )
        .expect("write");

        let s = section_offsets(BE32, &header);
        assert_eq!(out.len(), s.end);
        // The lone boot-table entry, big-endian.
        assert_eq!(&out[s.tables..s.tables + 4], &[0, 0, 0, 5]);
        // Heap words round-trip in target endianness.
        assert_eq!(&out[s.heap..s.heap + 4], &[0, 0, 0xAA, 0xBB]);
        // Code is padded to the word.
        assert_eq!(&out[s.code..s.code + 3], &[1, 2, 3]);
        assert_eq!(out[s.code + 3], 0);
    }

    #[test]
    fn header_magic_is_first_word() {
        let mut out = Vec::new();
        let header = ImageHeader::default();
        let heap = HeapBuffer::new(BE32, 1 << 12);
        write_image(
            &mut out,
            BE32,
            &header,
            &[],
            &[],
            &[],
            &[],
            &Bitmap::new(BE32),
            &heap,
            &Bitmap::new(BE32),
            &[],
        )
        .expect("write");
        assert_eq!(BE32.get32(&out), MAGIC);
        assert_eq!(out.len(), HEADER_WORDS * 4);
    }
}
