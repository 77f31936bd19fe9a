use abi::Abi;

/// An arena object id. `0` is the null reference.
///
/// Keeping host objects behind an integer id (rather than a raw pointer)
/// means a build-side reference can never be confused with a target-side
/// offset, and lets the build ABI differ from the machine actually running
/// the writer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Ref(u32);

impl Ref {
    pub const NULL: Ref = Ref(0);

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    #[inline(always)]
    fn index(self) -> usize {
        debug_assert!(!self.is_null(), "null dereference");
        self.0 as usize - 1
    }
}

impl core::fmt::Debug for Ref {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_null() {
            write!(f, "Ref(null)")
        } else {
            write!(f, "Ref({})", self.0)
        }
    }
}

/// One live object in build layout.
///
/// `data` is the complete byte image of the object as the build ABI lays it
/// out: word 0 holds the class reference, fields follow at their build
/// offsets, an optional tail array follows the fixed prefix. `refs` lists the
/// build-word offsets of every reference slot (word 0 included); it is fixed
/// at allocation and is all the heap walker needs to enumerate edges.
pub struct HostObject {
    pub data: Vec<u8>,
    pub refs: Vec<u32>,
}

/// Append-only arena of host objects.
pub struct Heap {
    abi: Abi,
    objects: Vec<HostObject>,
}

impl Heap {
    pub fn new(abi: Abi) -> Self {
        Self { abi, objects: Vec::new() }
    }

    #[inline(always)]
    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Allocate a zeroed object of `size_bytes` with the given class and
    /// reference-slot table.
    pub fn alloc(&mut self, class: Ref, size_bytes: usize, refs: Vec<u32>) -> Ref {
        debug_assert!(size_bytes % self.abi.word_bytes() == 0);
        let mut data = vec![0u8; size_bytes];
        if !class.is_null() {
            self.abi.put_word(&mut data, class.raw() as u64);
        }
        self.objects.push(HostObject { data, refs });
        Ref::from_index(self.objects.len() - 1)
    }

    #[inline]
    pub fn object(&self, p: Ref) -> &HostObject {
        &self.objects[p.index()]
    }

    #[inline]
    pub fn data(&self, p: Ref) -> &[u8] {
        &self.objects[p.index()].data
    }

    #[inline]
    pub fn class_of(&self, p: Ref) -> Ref {
        Ref::from_raw(self.get_word(p, 0) as u32)
    }

    /// Patch the class word; only used while bootstrapping the
    /// self-referential metaclass.
    pub fn set_class(&mut self, p: Ref, class: Ref) {
        self.put_word(p, 0, class.raw() as u64);
    }

    #[inline]
    pub fn get_word(&self, p: Ref, byte_offset: usize) -> u64 {
        self.abi.get_word(&self.objects[p.index()].data[byte_offset..])
    }

    #[inline]
    pub fn put_word(&mut self, p: Ref, byte_offset: usize, v: u64) {
        let abi = self.abi;
        abi.put_word(&mut self.objects[p.index()].data[byte_offset..], v);
    }

    /// Read the reference stored at build-word offset `word_offset`.
    #[inline]
    pub fn get_ref(&self, p: Ref, word_offset: u32) -> Ref {
        let off = word_offset as usize * self.abi.word_bytes();
        Ref::from_raw(self.get_word(p, off) as u32)
    }

    /// Store a reference at build-word offset `word_offset`. The slot must be
    /// in the object's reference table.
    pub fn put_ref(&mut self, p: Ref, word_offset: u32, value: Ref) {
        debug_assert!(
            self.objects[p.index()].refs.contains(&word_offset),
            "store to untracked reference slot {word_offset}"
        );
        let off = word_offset as usize * self.abi.word_bytes();
        self.put_word(p, off, value.raw() as u64);
    }

    pub fn put_bytes(&mut self, p: Ref, byte_offset: usize, bytes: &[u8]) {
        self.objects[p.index()].data[byte_offset..byte_offset + bytes.len()]
            .copy_from_slice(bytes);
    }

    /// Size of the object's build image in build words.
    #[inline]
    pub fn size_in_words(&self, p: Ref) -> usize {
        self.objects[p.index()].data.len() / self.abi.word_bytes()
    }
}
