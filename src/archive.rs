use anyhow::{Context, Result};
use ignore::WalkBuilder;
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use zip::write::{FileOptions, ZipWriter};
use zip::{CompressionMethod, ZipArchive};

/// Entries below this prefix belong to other Java versions of a
/// multi-release jar and are copied as they are.
pub const VERSIONED_PREFIX: &str = "META-INF/versions/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Jar,
    Directory,
    Class,
}

impl InputKind {
    pub fn of(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).with_context(|| format!("cannot read input: {}", path.display()))?;
        if meta.is_dir() {
            return Ok(InputKind::Directory);
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("class") => Ok(InputKind::Class),
            Some("jar" | "zip") => Ok(InputKind::Jar),
            _ => anyhow::bail!("input must be a jar, a directory or a .class file: {}", path.display()),
        }
    }
}

/// A file of the input, named by its `/`-separated path relative to the
/// input root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Entry {
    /// Whether the entry should go through the downgrader rather than be
    /// copied verbatim.
    pub fn is_class(&self) -> bool {
        self.name.ends_with(".class") && !self.name.contains(VERSIONED_PREFIX)
    }
}

pub fn read_entries(path: &Path, kind: InputKind) -> Result<Vec<Entry>> {
    match kind {
        InputKind::Jar => read_jar(path),
        InputKind::Directory => read_directory(path),
        InputKind::Class => {
            let bytes = fs::read(path).with_context(|| format!("cannot read class: {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(vec![Entry { name, bytes }])
        }
    }
}

fn read_jar(path: &Path) -> Result<Vec<Entry>> {
    let file = File::open(path).with_context(|| format!("cannot open jar: {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file).with_context(|| format!("mmap failed: {}", path.display()))? };
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
        .with_context(|| format!("cannot read zip structure: {}", path.display()))?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)
            .with_context(|| format!("cannot read {} from {}", file.name(), path.display()))?;
        entries.push(Entry {
            name: file.name().to_string(),
            bytes,
        });
    }
    Ok(entries)
}

fn read_directory(root: &Path) -> Result<Vec<Entry>> {
    let (tx, rx) = mpsc::channel();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry
                && entry.file_type().is_some_and(|t| t.is_file())
            {
                let _ = tx.send(entry.into_path());
            }
            ignore::WalkState::Continue
        })
    });
    drop(tx);

    let mut paths: Vec<PathBuf> = rx.iter().collect();
    paths.sort();
    paths
        .into_iter()
        .map(|path| {
            let bytes = fs::read(&path).with_context(|| format!("cannot read {}", path.display()))?;
            Ok(Entry {
                name: relative_name(root, &path),
                bytes,
            })
        })
        .collect()
}

fn relative_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Writes `entries` in the same shape as the input, replacing whatever was
/// at `path` before.
pub fn write_entries(path: &Path, kind: InputKind, entries: &[Entry]) -> Result<()> {
    match kind {
        InputKind::Jar => write_jar(path, entries),
        InputKind::Directory => {
            for entry in entries {
                let dest = path.join(&entry.name);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("cannot create directory: {}", parent.display()))?;
                }
                fs::write(&dest, &entry.bytes).with_context(|| format!("cannot write {}", dest.display()))?;
            }
            Ok(())
        }
        InputKind::Class => {
            let Some(entry) = entries.first() else {
                return Ok(());
            };
            let dest = if path.is_dir() { path.join(&entry.name) } else { path.to_path_buf() };
            fs::write(&dest, &entry.bytes).with_context(|| format!("cannot write {}", dest.display()))
        }
    }
}

fn write_jar(path: &Path, entries: &[Entry]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("cannot create directory: {}", parent.display()))?;
    }
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("cannot replace {}", path.display()))?;
        tracing::info!(path = %path.display(), "deleted previous output");
    }
    let file = File::create(path).with_context(|| format!("cannot create jar: {}", path.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for entry in entries {
        zip.start_file(entry.name.as_str(), options)
            .with_context(|| format!("cannot add {} to {}", entry.name, path.display()))?;
        zip.write_all(&entry.bytes)?;
    }
    zip.finish().with_context(|| format!("cannot finish jar: {}", path.display()))?;
    Ok(())
}
