use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bundlestore_protocol::StorageFormat;
use tar::EntryType;
use tracing::debug;

use crate::checksum::HashingWriter;
use crate::fs::{ensure_parent, open_source};
use crate::single_file::{copy_file_out, copy_into_new_file};
use crate::validation::{entry_name, entry_path};
use crate::{BundleError, BundleReader, BundleWriter, DataNodeInfo, TransferInfo};

/// Bundle stored as a pre-built TAR archive file.
///
/// The archive bytes are transferred as-is. Listing and the entry operations
/// look inside.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveFileBundleIo;

/// How a requested entry name matches the archive.
enum EntryMatch {
    File,
    Subtree,
}

fn locate_entry(source: &Path, wanted: &str) -> Result<Option<EntryMatch>, BundleError> {
    let prefix = format!("{wanted}/");
    let mut archive = tar::Archive::new(open_source(source)?);
    let mut found = None;
    for item in archive.entries()? {
        let item = item?;
        let name = entry_name(&item.path()?);
        if name == wanted && !item.header().entry_type().is_dir() {
            return Ok(Some(EntryMatch::File));
        }
        if name == wanted || name.starts_with(&prefix) {
            found = Some(EntryMatch::Subtree);
        }
    }
    Ok(found)
}

/// Rounds `size` up to whole 512-byte TAR blocks.
fn padded(size: u64) -> u64 {
    size.div_ceil(512) * 512
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl BundleReader for ArchiveFileBundleIo {
    fn supported_formats(&self) -> &'static [StorageFormat] {
        &[StorageFormat::ArchiveDataFile]
    }

    fn read_bundle(&self, source: &Path, out: &mut dyn Write) -> Result<TransferInfo, BundleError> {
        let info = copy_file_out(source, out)?;
        debug!(source = %source.display(), bytes = info.num_bytes, "read archive bundle");
        Ok(info)
    }

    fn list_content(&self, source: &Path, depth: usize) -> Result<Vec<DataNodeInfo>, BundleError> {
        let file = match open_source(source) {
            Ok(file) => file,
            Err(BundleError::SourceNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut archive = tar::Archive::new(file);
        let mut nodes = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            let path = entry.path()?;
            let parts: Vec<String> = path
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect();
            if parts.is_empty() || parts.len() > depth {
                continue;
            }
            let name = parts.join("/");
            let node = if entry.header().entry_type().is_dir() {
                DataNodeInfo::collection(name)
            } else {
                DataNodeInfo::file(name, entry.header().size()?)
            };
            nodes.push(node);
        }
        Ok(nodes)
    }

    fn read_entry(
        &self,
        source: &Path,
        entry: &str,
        out: &mut dyn Write,
    ) -> Result<TransferInfo, BundleError> {
        let wanted = entry_name(&entry_path(entry)?);
        let Some(found) = locate_entry(source, &wanted)? else {
            return Err(BundleError::EntryNotFound(entry.to_string()));
        };

        let prefix = format!("{wanted}/");
        let mut sink = HashingWriter::new(out);
        let mut archive = tar::Archive::new(open_source(source)?);
        match found {
            EntryMatch::File => {
                for item in archive.entries()? {
                    let mut item = item?;
                    if entry_name(&item.path()?) == wanted {
                        io::copy(&mut item, &mut sink)?;
                        break;
                    }
                }
            }
            EntryMatch::Subtree => {
                let mut builder = tar::Builder::new(&mut sink);
                for item in archive.entries()? {
                    let mut item = item?;
                    let name = entry_name(&item.path()?);
                    let Some(relative) = name.strip_prefix(&prefix) else {
                        continue;
                    };
                    let mut header = item.header().clone();
                    builder.append_data(&mut header, relative, &mut item)?;
                }
                builder.into_inner()?;
            }
        }

        sink.flush()?;
        let info = sink.finish();
        debug!(source = %source.display(), entry, bytes = info.num_bytes, "read archive entry");
        Ok(info)
    }
}

/// Entries already in an archive and the offset just past the last one.
struct ArchiveIndex {
    /// Entry name to whether it is a directory.
    entries: HashMap<String, bool>,
    end: u64,
}

fn index_archive(file: &File) -> Result<ArchiveIndex, BundleError> {
    let mut entries = HashMap::new();
    let mut end = 0u64;
    let mut archive = tar::Archive::new(file);
    for item in archive.entries()? {
        let item = item?;
        let name = entry_name(&item.path()?);
        end = item.raw_file_position() + padded(item.header().entry_size()?);
        entries.insert(name, item.header().entry_type().is_dir());
    }
    Ok(ArchiveIndex { entries, end })
}

/// Appends `name` to the archive at `bundle`, creating the archive and any
/// missing parent directory entries. `content` is `None` for a directory.
fn append_entry(bundle: &Path, name: &str, content: Option<&[u8]>) -> Result<u64, BundleError> {
    ensure_parent(bundle)?;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(bundle)?;
    let before = file.metadata()?.len();
    let index = index_archive(&file)?;

    if index.entries.contains_key(name) {
        return Err(BundleError::AlreadyExists(bundle.join(name)));
    }
    let mut missing_parents = Vec::new();
    let mut parent = Path::new(name).parent();
    while let Some(dir) = parent.filter(|p| !p.as_os_str().is_empty()) {
        let dir_name = entry_name(dir);
        match index.entries.get(&dir_name) {
            Some(true) => break,
            Some(false) => return Err(BundleError::NotADirectory(bundle.join(dir_name))),
            None => missing_parents.push(dir_name),
        }
        parent = dir.parent();
    }

    // Overwrites the old end-of-archive marker.
    file.set_len(index.end)?;
    file.seek(SeekFrom::Start(index.end))?;
    let mtime = now_secs();
    let mut builder = tar::Builder::new(&mut file);
    for dir in missing_parents.iter().rev() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(mtime);
        builder.append_data(&mut header, dir, io::empty())?;
    }
    let mut header = tar::Header::new_gnu();
    header.set_mtime(mtime);
    match content {
        Some(data) => {
            header.set_entry_type(EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, data)?;
        }
        None => {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            builder.append_data(&mut header, name, io::empty())?;
        }
    }
    builder.into_inner()?;

    let after = file.metadata()?.len();
    Ok(after.saturating_sub(before))
}

/// Rewrites the archive at `bundle` without `wanted` and everything below it.
fn rewrite_without(bundle: &Path, wanted: &str) -> Result<(), BundleError> {
    let prefix = format!("{wanted}/");
    let file_name = bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let scratch = bundle.with_file_name(format!(".{file_name}.rewrite"));

    let result = (|| -> Result<(), BundleError> {
        let mut builder = tar::Builder::new(File::create(&scratch)?);
        let mut archive = tar::Archive::new(open_source(bundle)?);
        for item in archive.entries()? {
            let mut item = item?;
            let path: PathBuf = item.path()?.into_owned();
            let name = entry_name(&path);
            if name == wanted || name.starts_with(&prefix) {
                continue;
            }
            let mut header = item.header().clone();
            builder.append_data(&mut header, &path, &mut item)?;
        }
        builder.into_inner()?.sync_all()?;
        fs::rename(&scratch, bundle)?;
        Ok(())
    })();

    if result.is_err() {
        if let Err(e) = fs::remove_file(&scratch) {
            debug!(scratch = %scratch.display(), "could not remove rewrite scratch: {e}");
        }
    }
    result
}

impl BundleWriter for ArchiveFileBundleIo {
    fn supported_formats(&self) -> &'static [StorageFormat] {
        &[StorageFormat::ArchiveDataFile]
    }

    fn write_bundle(
        &self,
        input: &mut dyn Read,
        target: &Path,
    ) -> Result<TransferInfo, BundleError> {
        let info = copy_into_new_file(input, target)?;
        debug!(target = %target.display(), bytes = info.num_bytes, "wrote archive bundle");
        Ok(info)
    }

    fn create_directory_entry(&self, bundle: &Path, entry: &str) -> Result<u64, BundleError> {
        let name = entry_name(&entry_path(entry)?);
        let grown = append_entry(bundle, &name, None)?;
        debug!(bundle = %bundle.display(), entry, grown, "appended directory entry");
        Ok(grown)
    }

    /// The content is buffered in memory, since a TAR header carries the
    /// entry size ahead of the data.
    fn create_file_entry(
        &self,
        bundle: &Path,
        entry: &str,
        content: &mut dyn Read,
    ) -> Result<u64, BundleError> {
        let name = entry_name(&entry_path(entry)?);
        let mut data = Vec::new();
        content.read_to_end(&mut data)?;
        let grown = append_entry(bundle, &name, Some(&data))?;
        debug!(bundle = %bundle.display(), entry, grown, "appended file entry");
        Ok(grown)
    }

    fn delete_entry(&self, bundle: &Path, entry: &str) -> Result<u64, BundleError> {
        let wanted = entry_name(&entry_path(entry)?);
        let found = match locate_entry(bundle, &wanted) {
            Ok(found) => found,
            Err(BundleError::SourceNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if found.is_none() {
            return Ok(0);
        }

        let before = fs::metadata(bundle)?.len();
        rewrite_without(bundle, &wanted)?;
        let freed = before.saturating_sub(fs::metadata(bundle)?.len());
        debug!(bundle = %bundle.display(), entry, freed, "deleted archive entry");
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_archive(path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder.append_data(&mut dir, "stack", std::io::empty()).unwrap();

        for (name, body) in [("stack/z0.tif", &b"0123"[..]), ("stack/z1.tif", &b"456"[..])] {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn bytes_pass_through_unchanged() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("bundle.tar");
        build_archive(&source);
        let original = std::fs::read(&source).unwrap();

        let mut out = Vec::new();
        let read = ArchiveFileBundleIo.read_bundle(&source, &mut out).unwrap();
        assert_eq!(out, original);

        let target = dir.path().join("copy.tar");
        let written = ArchiveFileBundleIo
            .write_bundle(&mut &out[..], &target)
            .unwrap();
        assert_eq!(written, read);
        assert_eq!(std::fs::read(&target).unwrap(), original);
    }

    #[test]
    fn listing_reads_entry_table() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("bundle.tar");
        build_archive(&source);

        let top = ArchiveFileBundleIo.list_content(&source, 1).unwrap();
        assert_eq!(top, vec![DataNodeInfo::collection("stack")]);

        let all = ArchiveFileBundleIo.list_content(&source, 2).unwrap();
        assert_eq!(
            all,
            vec![
                DataNodeInfo::collection("stack"),
                DataNodeInfo::file("stack/z0.tif", 4),
                DataNodeInfo::file("stack/z1.tif", 3),
            ]
        );
    }

    #[test]
    fn read_entry_streams_file_or_subtree() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("bundle.tar");
        build_archive(&source);

        let mut file = Vec::new();
        let info = ArchiveFileBundleIo
            .read_entry(&source, "stack/z0.tif", &mut file)
            .unwrap();
        assert_eq!(file, b"0123");
        assert_eq!(info.num_bytes, 4);

        let mut subtree = Vec::new();
        ArchiveFileBundleIo
            .read_entry(&source, "stack", &mut subtree)
            .unwrap();
        let mut archive = tar::Archive::new(&subtree[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["z0.tif", "z1.tif"]);

        let mut out = Vec::new();
        assert!(matches!(
            ArchiveFileBundleIo.read_entry(&source, "stack/z9.tif", &mut out),
            Err(BundleError::EntryNotFound(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn entries_are_appended_and_deleted() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("new/bundle.tar");
        let io = ArchiveFileBundleIo;

        let grown = io
            .create_file_entry(&bundle, "tiles/0/chunk", &mut &[3u8; 600][..])
            .unwrap();
        // Two parent directories, one header plus two data blocks, and the
        // end-of-archive marker.
        assert_eq!(grown, 2 * 512 + 512 + 1024 + 1024);
        assert!(io.create_directory_entry(&bundle, "tiles/1").unwrap() > 0);

        assert!(matches!(
            io.create_directory_entry(&bundle, "tiles/0"),
            Err(BundleError::AlreadyExists(_))
        ));
        assert!(matches!(
            io.create_file_entry(&bundle, "tiles/0/chunk/x", &mut &b"x"[..]),
            Err(BundleError::NotADirectory(_))
        ));

        let listed = io.list_content(&bundle, 3).unwrap();
        assert_eq!(
            listed,
            vec![
                DataNodeInfo::collection("tiles"),
                DataNodeInfo::collection("tiles/0"),
                DataNodeInfo::file("tiles/0/chunk", 600),
                DataNodeInfo::collection("tiles/1"),
            ]
        );

        let mut chunk = Vec::new();
        io.read_entry(&bundle, "tiles/0/chunk", &mut chunk).unwrap();
        assert_eq!(chunk, vec![3u8; 600]);

        let freed = io.delete_entry(&bundle, "tiles/0").unwrap();
        assert_eq!(freed, 3 * 512 + 512);
        assert_eq!(io.delete_entry(&bundle, "tiles/0").unwrap(), 0);
        assert_eq!(
            io.list_content(&bundle, 3).unwrap(),
            vec![DataNodeInfo::collection("tiles"), DataNodeInfo::collection("tiles/1")]
        );
        assert_eq!(io.delete_entry(&dir.path().join("none.tar"), "x").unwrap(), 0);
    }

    #[test]
    fn existing_target_fails() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("exists.tar");
        std::fs::write(&target, b"old").unwrap();
        let err = ArchiveFileBundleIo
            .write_bundle(&mut &b"new"[..], &target)
            .unwrap_err();
        assert!(matches!(err, BundleError::AlreadyExists(_)));
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
    }
}
