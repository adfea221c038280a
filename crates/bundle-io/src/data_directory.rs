//! Directory bundles, streamed as a TAR archive.
//!
//! The reader walks the tree breadth-first with an explicit work queue,
//! visiting siblings in name order so the stream is deterministic. Every
//! directory below the root gets its own zero-length entry, which keeps empty
//! directories across a round trip. Symlinks are skipped. The writer unpacks
//! such a stream into a fresh directory and then drains whatever follows the
//! end-of-archive marker, so both sides account for the same bytes.

use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bundlestore_protocol::StorageFormat;
use tar::EntryType;
use tracing::{debug, warn};

use crate::checksum::{HashingReader, HashingWriter};
use crate::fs::{create_new_dir, remove_path};
use crate::single_file::{copy_file_out, copy_into_new_file};
use crate::validation::{entry_path, validate_entry_path};
use crate::{BundleError, BundleReader, BundleWriter, DataNodeInfo, TransferInfo};

#[derive(Debug, Default, Clone, Copy)]
pub struct DataDirectoryBundleIo;

/// A directory child queued for visiting.
struct Pending {
    /// Absolute location on disk.
    path: PathBuf,
    /// `/`-separated path relative to the bundle root.
    name: String,
    depth: usize,
}

/// Sorted children of `dir`, paired with their relative names.
fn sorted_children(dir: &Path, prefix: &str, depth: usize) -> Result<Vec<Pending>, BundleError> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let name = if prefix.is_empty() {
            file_name
        } else {
            format!("{prefix}/{file_name}")
        };
        children.push(Pending {
            path: entry.path(),
            name,
            depth,
        });
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}

fn require_directory(source: &Path) -> Result<(), BundleError> {
    match fs::metadata(source) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(BundleError::NotADirectory(source.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(BundleError::SourceNotFound(source.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Metadata of a queued node, or `None` for a symlink.
fn node_metadata(node: &Pending) -> Result<Option<fs::Metadata>, BundleError> {
    let meta = fs::symlink_metadata(&node.path)?;
    if meta.file_type().is_symlink() {
        warn!(entry = %node.name, "skipping symlink in directory bundle");
        return Ok(None);
    }
    Ok(Some(meta))
}

impl BundleReader for DataDirectoryBundleIo {
    fn supported_formats(&self) -> &'static [StorageFormat] {
        &[StorageFormat::DataDirectory]
    }

    fn read_bundle(&self, source: &Path, out: &mut dyn Write) -> Result<TransferInfo, BundleError> {
        require_directory(source)?;

        let mut builder = tar::Builder::new(HashingWriter::new(out));
        let mut queue: VecDeque<Pending> = sorted_children(source, "", 1)?.into();
        let mut entries = 0usize;

        while let Some(node) = queue.pop_front() {
            let Some(meta) = node_metadata(&node)? else {
                continue;
            };
            if meta.is_dir() {
                builder.append_dir(&node.name, &node.path)?;
                queue.extend(sorted_children(&node.path, &node.name, node.depth + 1)?);
            } else {
                builder.append_path_with_name(&node.path, &node.name)?;
            }
            entries += 1;
        }

        let mut writer = builder.into_inner()?;
        writer.flush()?;
        let info = writer.finish();
        debug!(
            source = %source.display(),
            entries,
            bytes = info.num_bytes,
            "read directory bundle"
        );
        Ok(info)
    }

    fn list_content(&self, source: &Path, depth: usize) -> Result<Vec<DataNodeInfo>, BundleError> {
        match require_directory(source) {
            Ok(()) => {}
            Err(BundleError::SourceNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut nodes = Vec::new();
        let mut queue: VecDeque<Pending> = sorted_children(source, "", 1)?.into();
        while let Some(node) = queue.pop_front() {
            if node.depth > depth {
                continue;
            }
            let Some(meta) = node_metadata(&node)? else {
                continue;
            };
            if meta.is_dir() {
                if node.depth < depth {
                    queue.extend(sorted_children(&node.path, &node.name, node.depth + 1)?);
                }
                nodes.push(DataNodeInfo::collection(node.name));
            } else {
                nodes.push(DataNodeInfo::file(node.name, meta.len()));
            }
        }
        Ok(nodes)
    }

    fn read_entry(
        &self,
        source: &Path,
        entry: &str,
        out: &mut dyn Write,
    ) -> Result<TransferInfo, BundleError> {
        require_directory(source)?;
        let path = source.join(entry_path(entry)?);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BundleError::EntryNotFound(entry.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            self.read_bundle(&path, out)
        } else if meta.is_file() {
            copy_file_out(&path, out)
        } else {
            Err(BundleError::EntryNotFound(entry.to_string()))
        }
    }
}

/// Location of a new entry under `root`, with the root and the entry's parent
/// created when missing.
fn new_entry_location(root: &Path, entry: &str) -> Result<PathBuf, BundleError> {
    let path = root.join(entry_path(entry)?);
    if let Some(parent) = path.parent() {
        match fs::symlink_metadata(parent) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(BundleError::NotADirectory(parent.to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => fs::create_dir_all(parent)?,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(path)
}

impl BundleWriter for DataDirectoryBundleIo {
    fn supported_formats(&self) -> &'static [StorageFormat] {
        &[StorageFormat::DataDirectory]
    }

    fn write_bundle(
        &self,
        input: &mut dyn Read,
        target: &Path,
    ) -> Result<TransferInfo, BundleError> {
        create_new_dir(target)?;

        let mut reader = HashingReader::new(input);
        let entries = unpack(&mut reader, target)?;
        let trailing = reader.drain()?;

        let info = reader.finish();
        debug!(
            target = %target.display(),
            entries,
            trailing,
            bytes = info.num_bytes,
            "wrote directory bundle"
        );
        Ok(info)
    }

    fn create_directory_entry(&self, bundle: &Path, entry: &str) -> Result<u64, BundleError> {
        let path = new_entry_location(bundle, entry)?;
        create_new_dir(&path)?;
        debug!(bundle = %bundle.display(), entry, "created directory entry");
        Ok(0)
    }

    fn create_file_entry(
        &self,
        bundle: &Path,
        entry: &str,
        content: &mut dyn Read,
    ) -> Result<u64, BundleError> {
        let path = new_entry_location(bundle, entry)?;
        let info = copy_into_new_file(content, &path)?;
        debug!(bundle = %bundle.display(), entry, bytes = info.num_bytes, "created file entry");
        Ok(info.num_bytes)
    }

    fn delete_entry(&self, bundle: &Path, entry: &str) -> Result<u64, BundleError> {
        let freed = remove_path(&bundle.join(entry_path(entry)?))?;
        debug!(bundle = %bundle.display(), entry, freed, "deleted entry");
        Ok(freed)
    }
}

fn unpack<R: Read>(reader: &mut R, target: &Path) -> Result<usize, BundleError> {
    let mut archive = tar::Archive::new(reader);
    let mut count = 0usize;
    // Applied once every entry is written, so a read-only directory can
    // still receive its children.
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        validate_entry_path(&path)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                let dir = target.join(&path);
                fs::create_dir_all(&dir)?;
                dir_modes.push((dir, entry.header().mode()?));
            }
            EntryType::Regular | EntryType::Continuous => {
                if !entry.unpack_in(target)? {
                    return Err(BundleError::InvalidEntry(format!(
                        "entry escapes target: {}",
                        path.display()
                    )));
                }
            }
            other => {
                return Err(BundleError::InvalidEntry(format!(
                    "unsupported entry type {other:?} for {}",
                    path.display()
                )));
            }
        }
        count += 1;
    }

    apply_dir_modes(dir_modes)?;
    Ok(count)
}

/// Sets directory modes deepest first.
#[cfg(unix)]
fn apply_dir_modes(mut dir_modes: Vec<(PathBuf, u32)>) -> Result<(), BundleError> {
    use std::os::unix::fs::PermissionsExt;

    dir_modes.sort_by_key(|(dir, _)| std::cmp::Reverse(dir.components().count()));
    for (dir, mode) in dir_modes {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode & 0o777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_dir_modes(_dir_modes: Vec<(PathBuf, u32)>) -> Result<(), BundleError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Files of 10, 20 and 30 bytes plus one empty subdirectory.
    fn sample_tree(root: &Path) {
        fs::create_dir_all(root).unwrap();
        fs::write(root.join("a.txt"), vec![b'a'; 10]).unwrap();
        fs::write(root.join("b.txt"), vec![b'b'; 20]).unwrap();
        fs::write(root.join("c.txt"), vec![b'c'; 30]).unwrap();
        fs::create_dir(root.join("empty")).unwrap();
    }

    fn tar_bytes(source: &Path) -> (Vec<u8>, TransferInfo) {
        let mut out = Vec::new();
        let info = DataDirectoryBundleIo.read_bundle(source, &mut out).unwrap();
        (out, info)
    }

    #[test]
    fn framing_size_matches_tar_layout() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        sample_tree(&source);

        let (bytes, info) = tar_bytes(&source);
        // Three files at header + one padded block each, one directory
        // header, then the two-block end-of-archive marker.
        assert_eq!(info.num_bytes, 3 * (512 + 512) + 512 + 1024);
        assert_eq!(bytes.len() as u64, info.num_bytes);
        assert_eq!(info.checksum, crate::checksum_bytes(&bytes));
    }

    #[test]
    fn round_trip_keeps_empty_directory() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        sample_tree(&source);
        let (bytes, sent) = tar_bytes(&source);

        let target = dir.path().join("dst");
        let received = DataDirectoryBundleIo
            .write_bundle(&mut &bytes[..], &target)
            .unwrap();

        assert_eq!(received, sent);
        assert_eq!(fs::read(target.join("a.txt")).unwrap(), vec![b'a'; 10]);
        assert_eq!(fs::read(target.join("c.txt")).unwrap(), vec![b'c'; 30]);
        assert!(target.join("empty").is_dir());
        assert_eq!(fs::read_dir(target.join("empty")).unwrap().count(), 0);
        assert_eq!(crate::path_size(&target).unwrap(), 60);
    }

    #[test]
    fn nested_tree_round_trip() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("tiles/0/1")).unwrap();
        fs::write(source.join("attributes.json"), b"{}").unwrap();
        fs::write(source.join("tiles/0/1/chunk"), vec![9u8; 5000]).unwrap();

        let (bytes, _) = tar_bytes(&source);
        let target = dir.path().join("dst");
        DataDirectoryBundleIo
            .write_bundle(&mut &bytes[..], &target)
            .unwrap();
        assert_eq!(
            fs::read(target.join("tiles/0/1/chunk")).unwrap(),
            vec![9u8; 5000]
        );
    }

    #[test]
    fn stream_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        sample_tree(&source);
        let (first, _) = tar_bytes(&source);
        let (second, _) = tar_bytes(&source);
        assert_eq!(first, second);
    }

    #[test]
    fn existing_target_is_left_untouched() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        sample_tree(&source);
        let (bytes, _) = tar_bytes(&source);

        let target = dir.path().join("dst");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep.txt"), b"keep").unwrap();

        let err = DataDirectoryBundleIo
            .write_bundle(&mut &bytes[..], &target)
            .unwrap_err();
        assert!(matches!(err, BundleError::AlreadyExists(_)));
        assert_eq!(fs::read_dir(&target).unwrap().count(), 1);
        assert_eq!(fs::read(target.join("keep.txt")).unwrap(), b"keep");
    }

    #[test]
    fn traversal_entry_is_rejected() {
        // tar::Builder refuses `..` names, so write the header by hand.
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.as_gnu_mut().unwrap().name[..9].copy_from_slice(b"../escape");
        header.set_cksum();

        let mut stream = header.as_bytes().to_vec();
        let mut data = [0u8; 512];
        data[..4].copy_from_slice(b"evil");
        stream.extend_from_slice(&data);
        stream.extend_from_slice(&[0u8; 1024]);

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("dst");
        let err = DataDirectoryBundleIo
            .write_bundle(&mut &stream[..], &target)
            .unwrap_err();
        assert!(matches!(err, BundleError::InvalidEntry(_)));
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn listing_respects_depth() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        sample_tree(&source);
        fs::create_dir_all(source.join("sub/inner")).unwrap();
        fs::write(source.join("sub/inner/deep.txt"), b"deep").unwrap();

        let shallow = DataDirectoryBundleIo.list_content(&source, 1).unwrap();
        let names: Vec<_> = shallow.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt", "c.txt", "empty", "sub"]);
        assert!(shallow[3].collection);
        assert_eq!(shallow[1].size, 20);

        let deep = DataDirectoryBundleIo.list_content(&source, 3).unwrap();
        assert!(deep.contains(&DataNodeInfo::file("sub/inner/deep.txt", 4)));
        assert!(deep.contains(&DataNodeInfo::collection("sub/inner")));
    }

    #[cfg(unix)]
    #[test]
    fn read_only_directory_keeps_children_and_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("frozen/inner")).unwrap();
        fs::write(source.join("frozen/data.bin"), vec![5u8; 300]).unwrap();
        fs::write(source.join("frozen/inner/leaf"), b"leaf").unwrap();
        for ro in ["frozen/inner", "frozen"] {
            fs::set_permissions(source.join(ro), fs::Permissions::from_mode(0o555)).unwrap();
        }

        let (bytes, _) = tar_bytes(&source);
        let target = dir.path().join("dst");
        let result = DataDirectoryBundleIo.write_bundle(&mut &bytes[..], &target);

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        let frozen_mode = mode(&target.join("frozen"));
        let inner_mode = mode(&target.join("frozen/inner"));
        let data = fs::read(target.join("frozen/data.bin")).unwrap();
        let leaf = fs::read(target.join("frozen/inner/leaf")).unwrap();

        for root in [&source, &target] {
            for rw in ["frozen", "frozen/inner"] {
                fs::set_permissions(root.join(rw), fs::Permissions::from_mode(0o755)).unwrap();
            }
        }

        result.unwrap();
        assert_eq!(frozen_mode, 0o555);
        assert_eq!(inner_mode, 0o555);
        assert_eq!(data, vec![5u8; 300]);
        assert_eq!(leaf, b"leaf");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        sample_tree(&source);
        std::os::unix::fs::symlink(&source, source.join("loop")).unwrap();
        std::os::unix::fs::symlink(source.join("a.txt"), source.join("alias")).unwrap();

        let (bytes, info) = tar_bytes(&source);
        assert_eq!(info.num_bytes, 4608);

        let target = dir.path().join("dst");
        DataDirectoryBundleIo
            .write_bundle(&mut &bytes[..], &target)
            .unwrap();
        assert!(!target.join("loop").exists());
        assert!(!target.join("alias").exists());

        let listed = DataDirectoryBundleIo.list_content(&source, 5).unwrap();
        let names: Vec<_> = listed.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt", "c.txt", "empty"]);
    }

    #[test]
    fn read_entry_streams_file_or_subtree() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        sample_tree(&source);
        fs::create_dir_all(source.join("sub/inner")).unwrap();
        fs::write(source.join("sub/inner/deep.txt"), b"deep").unwrap();

        let mut file = Vec::new();
        let info = DataDirectoryBundleIo
            .read_entry(&source, "b.txt", &mut file)
            .unwrap();
        assert_eq!(file, vec![b'b'; 20]);
        assert_eq!(info.num_bytes, 20);

        let mut subtree = Vec::new();
        DataDirectoryBundleIo
            .read_entry(&source, "./sub/", &mut subtree)
            .unwrap();
        let target = dir.path().join("sub-copy");
        DataDirectoryBundleIo
            .write_bundle(&mut &subtree[..], &target)
            .unwrap();
        assert_eq!(fs::read(target.join("inner/deep.txt")).unwrap(), b"deep");

        let mut out = Vec::new();
        assert!(matches!(
            DataDirectoryBundleIo.read_entry(&source, "nope", &mut out),
            Err(BundleError::EntryNotFound(_))
        ));
        assert!(matches!(
            DataDirectoryBundleIo.read_entry(&source, "../src/a.txt", &mut out),
            Err(BundleError::InvalidEntry(_))
        ));
    }

    #[test]
    fn entries_are_created_and_deleted() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("bundle");
        let io = DataDirectoryBundleIo;

        assert_eq!(io.create_directory_entry(&bundle, "tiles/0").unwrap(), 0);
        assert!(bundle.join("tiles/0").is_dir());
        assert_eq!(
            io.create_file_entry(&bundle, "tiles/0/chunk", &mut &[7u8; 90][..])
                .unwrap(),
            90
        );
        assert_eq!(
            io.create_file_entry(&bundle, "meta/attributes.json", &mut &b"{}"[..])
                .unwrap(),
            2
        );

        assert!(matches!(
            io.create_file_entry(&bundle, "tiles/0/chunk", &mut &b"x"[..]),
            Err(BundleError::AlreadyExists(_))
        ));
        assert!(matches!(
            io.create_directory_entry(&bundle, "tiles"),
            Err(BundleError::AlreadyExists(_))
        ));
        assert!(matches!(
            io.create_directory_entry(&bundle, "tiles/0/chunk/under"),
            Err(BundleError::NotADirectory(_))
        ));
        assert_eq!(fs::read(bundle.join("tiles/0/chunk")).unwrap(), vec![7u8; 90]);

        assert_eq!(io.delete_entry(&bundle, "tiles").unwrap(), 90);
        assert!(!bundle.join("tiles").exists());
        assert_eq!(io.delete_entry(&bundle, "tiles").unwrap(), 0);
        assert_eq!(crate::path_size(&bundle).unwrap(), 2);
    }

    #[test]
    fn file_source_is_not_a_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        let mut out = Vec::new();
        let err = DataDirectoryBundleIo.read_bundle(&file, &mut out).unwrap_err();
        assert!(matches!(err, BundleError::NotADirectory(_)));
    }
}
