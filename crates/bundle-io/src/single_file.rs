use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use bundlestore_protocol::StorageFormat;
use tracing::debug;

use crate::checksum::{HashingReader, HashingWriter};
use crate::fs::{create_new_file, open_source};
use crate::{BundleError, BundleReader, BundleWriter, COPY_BUFFER_SIZE, DataNodeInfo, TransferInfo};

/// Bundle stored as one plain file, transferred verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleFileBundleIo;

impl BundleReader for SingleFileBundleIo {
    fn supported_formats(&self) -> &'static [StorageFormat] {
        &[StorageFormat::SingleDataFile]
    }

    fn read_bundle(&self, source: &Path, out: &mut dyn Write) -> Result<TransferInfo, BundleError> {
        let info = copy_file_out(source, out)?;
        debug!(source = %source.display(), bytes = info.num_bytes, "read single file bundle");
        Ok(info)
    }

    fn list_content(&self, source: &Path, _depth: usize) -> Result<Vec<DataNodeInfo>, BundleError> {
        list_single_file(source)
    }
}

impl BundleWriter for SingleFileBundleIo {
    fn supported_formats(&self) -> &'static [StorageFormat] {
        &[StorageFormat::SingleDataFile]
    }

    fn write_bundle(
        &self,
        input: &mut dyn Read,
        target: &Path,
    ) -> Result<TransferInfo, BundleError> {
        let info = copy_into_new_file(input, target)?;
        debug!(target = %target.display(), bytes = info.num_bytes, "wrote single file bundle");
        Ok(info)
    }
}

/// Streams the file at `source` into `out`, hashing what was written.
pub(crate) fn copy_file_out(
    source: &Path,
    out: &mut dyn Write,
) -> Result<TransferInfo, BundleError> {
    let mut file = open_source(source)?;
    let mut writer = HashingWriter::new(out);
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
    }
    writer.flush()?;
    Ok(writer.finish())
}

/// Streams `input` to end-of-stream into a newly created file at `target`.
pub(crate) fn copy_into_new_file(
    input: &mut dyn Read,
    target: &Path,
) -> Result<TransferInfo, BundleError> {
    let file = create_new_file(target)?;
    let mut reader = HashingReader::new(input);
    let mut out = BufWriter::with_capacity(COPY_BUFFER_SIZE, file);
    io::copy(&mut reader, &mut out)?;
    out.flush()?;
    Ok(reader.finish())
}

/// A plain file lists as a single entry named after the file.
pub(crate) fn list_single_file(source: &Path) -> Result<Vec<DataNodeInfo>, BundleError> {
    let meta = match std::fs::metadata(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(vec![DataNodeInfo::file(name, meta.len())])
}
