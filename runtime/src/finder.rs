use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// The classpath: every file under a directory root, as
/// `(relative name, mapped bytes)` pairs. Names use `/` separators so a
/// nested `.class` file's name matches its class name plus extension.
pub struct Classpath {
    entries: Vec<(String, Vec<u8>)>,
}

impl Classpath {
    /// Enumerate `root` recursively. Entries are sorted by name so scans are
    /// deterministic regardless of directory iteration order.
    pub fn open(root: &Path) -> io::Result<Self> {
        let mut files = Vec::new();
        collect(root, root, &mut files)?;
        files.sort();

        let mut entries = Vec::with_capacity(files.len());
        for (name, path) in files {
            entries.push((name, fs::read(&path)?));
        }
        Ok(Self { entries })
    }

    /// A classpath assembled in memory; used by tests.
    pub fn from_entries(entries: Vec<(String, Vec<u8>)>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, b)| (n.as_str(), b.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn collect(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("entry under root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((rel, path));
        }
    }
    Ok(())
}
