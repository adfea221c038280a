use std::collections::HashMap;
use std::sync::Arc;

use bundlestore_protocol::StorageFormat;

use crate::{
    ArchiveFileBundleIo, BundleError, BundleReader, BundleWriter, DataDirectoryBundleIo,
    SingleFileBundleIo,
};

/// Strategy lookup keyed by [`StorageFormat`].
///
/// Populated once at startup; each format maps to at most one reader and one
/// writer.
#[derive(Default, Clone)]
pub struct BundleIoRegistry {
    readers: HashMap<StorageFormat, Arc<dyn BundleReader>>,
    writers: HashMap<StorageFormat, Arc<dyn BundleWriter>>,
}

impl BundleIoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in strategies for every format.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.insert_both(Arc::new(SingleFileBundleIo));
        registry.insert_both(Arc::new(DataDirectoryBundleIo));
        registry.insert_both(Arc::new(ArchiveFileBundleIo));
        registry
    }

    fn insert_both<S>(&mut self, strategy: Arc<S>)
    where
        S: BundleReader + BundleWriter + 'static,
    {
        for format in BundleReader::supported_formats(strategy.as_ref()) {
            self.readers.insert(*format, strategy.clone());
        }
        for format in BundleWriter::supported_formats(strategy.as_ref()) {
            self.writers.insert(*format, strategy.clone());
        }
    }

    /// Registers a reader for every format it supports.
    ///
    /// Nothing is registered if any of its formats already has a reader.
    pub fn register_reader(&mut self, reader: Arc<dyn BundleReader>) -> Result<(), BundleError> {
        let formats = reader.supported_formats();
        if let Some(taken) = formats.iter().find(|f| self.readers.contains_key(*f)) {
            return Err(BundleError::AmbiguousStrategy(*taken));
        }
        for format in formats {
            self.readers.insert(*format, reader.clone());
        }
        Ok(())
    }

    /// Registers a writer for every format it supports.
    pub fn register_writer(&mut self, writer: Arc<dyn BundleWriter>) -> Result<(), BundleError> {
        let formats = writer.supported_formats();
        if let Some(taken) = formats.iter().find(|f| self.writers.contains_key(*f)) {
            return Err(BundleError::AmbiguousStrategy(*taken));
        }
        for format in formats {
            self.writers.insert(*format, writer.clone());
        }
        Ok(())
    }

    pub fn reader(
        &self,
        format: Option<StorageFormat>,
    ) -> Result<Arc<dyn BundleReader>, BundleError> {
        format
            .and_then(|f| self.readers.get(&f).cloned())
            .ok_or_else(|| BundleError::no_strategy(format))
    }

    pub fn writer(
        &self,
        format: Option<StorageFormat>,
    ) -> Result<Arc<dyn BundleWriter>, BundleError> {
        format
            .and_then(|f| self.writers.get(&f).cloned())
            .ok_or_else(|| BundleError::no_strategy(format))
    }
}

impl std::fmt::Debug for BundleIoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleIoRegistry")
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .field("writers", &self.writers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_format() {
        let registry = BundleIoRegistry::with_defaults();
        for format in StorageFormat::ALL {
            assert!(registry.reader(Some(format)).is_ok());
            assert!(registry.writer(Some(format)).is_ok());
        }
    }

    #[test]
    fn absent_format_has_no_strategy() {
        let registry = BundleIoRegistry::with_defaults();
        let err = registry.writer(None).err().unwrap();
        assert!(matches!(err, BundleError::NoStrategy(_)));
    }

    #[test]
    fn unregistered_format_has_no_strategy() {
        let registry = BundleIoRegistry::new();
        let err = registry
            .reader(Some(StorageFormat::DataDirectory))
            .err()
            .unwrap();
        assert!(matches!(err, BundleError::NoStrategy(name) if name == "DATA_DIRECTORY"));
    }

    #[test]
    fn second_strategy_for_format_is_ambiguous() {
        let mut registry = BundleIoRegistry::new();
        registry
            .register_reader(Arc::new(SingleFileBundleIo))
            .unwrap();
        let err = registry
            .register_reader(Arc::new(SingleFileBundleIo))
            .unwrap_err();
        assert!(matches!(
            err,
            BundleError::AmbiguousStrategy(StorageFormat::SingleDataFile)
        ));

        registry
            .register_writer(Arc::new(ArchiveFileBundleIo))
            .unwrap();
        let err = BundleIoRegistry::with_defaults()
            .register_writer(Arc::new(ArchiveFileBundleIo))
            .unwrap_err();
        assert!(matches!(
            err,
            BundleError::AmbiguousStrategy(StorageFormat::ArchiveDataFile)
        ));
    }

    #[test]
    fn lookup_returns_matching_strategy() {
        let registry = BundleIoRegistry::with_defaults();
        let reader = registry.reader(Some(StorageFormat::DataDirectory)).unwrap();
        assert_eq!(reader.supported_formats(), &[StorageFormat::DataDirectory]);
    }
}
