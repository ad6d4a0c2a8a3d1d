//! Backing store for evicted pages.

use crate::EnvId;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PageFileError {
    #[error("page is not in the page file")]
    NotPresent,
    #[error("page file is full")]
    Full,
}

/// Per-environment page storage keyed by page address.
pub trait PageFile {
    /// Copy the stored page into `page`.
    ///
    /// # Errors
    /// [`PageFileError::NotPresent`] if the page was never written.
    fn read_page(
        &mut self,
        env: EnvId,
        va: VirtualAddress,
        page: &mut [u8],
    ) -> Result<(), PageFileError>;

    /// Store `page`, replacing any earlier copy.
    ///
    /// # Errors
    /// [`PageFileError::Full`] if there is no room for a new page.
    fn update_page(
        &mut self,
        env: EnvId,
        va: VirtualAddress,
        page: &[u8],
    ) -> Result<(), PageFileError>;

    /// Forget the stored page, if any.
    fn remove_page(&mut self, env: EnvId, va: VirtualAddress);
}

/// A page file held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryPageFile {
    pages: BTreeMap<(EnvId, VirtualAddress), Vec<u8>>,
    capacity: usize,
    reads: u64,
    writes: u64,
}

impl MemoryPageFile {
    /// A page file holding at most `capacity` pages.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            pages: BTreeMap::new(),
            capacity,
            reads: 0,
            writes: 0,
        }
    }

    #[must_use]
    pub fn stored(&self, env: EnvId, va: VirtualAddress) -> Option<&[u8]> {
        self.pages.get(&(env, va.page_base())).map(Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    #[must_use]
    pub const fn reads(&self) -> u64 {
        self.reads
    }

    #[must_use]
    pub const fn writes(&self) -> u64 {
        self.writes
    }
}

impl PageFile for MemoryPageFile {
    fn read_page(
        &mut self,
        env: EnvId,
        va: VirtualAddress,
        page: &mut [u8],
    ) -> Result<(), PageFileError> {
        let stored = self
            .pages
            .get(&(env, va.page_base()))
            .ok_or(PageFileError::NotPresent)?;
        let n = page.len().min(stored.len());
        page[..n].copy_from_slice(&stored[..n]);
        self.reads += 1;
        Ok(())
    }

    fn update_page(
        &mut self,
        env: EnvId,
        va: VirtualAddress,
        page: &[u8],
    ) -> Result<(), PageFileError> {
        let key = (env, va.page_base());
        if !self.pages.contains_key(&key) && self.pages.len() >= self.capacity {
            return Err(PageFileError::Full);
        }
        self.pages.insert(key, page.to_vec());
        self.writes += 1;
        Ok(())
    }

    fn remove_page(&mut self, env: EnvId, va: VirtualAddress) {
        self.pages.remove(&(env, va.page_base()));
    }
}
