//! Fixed-length file-backed memory mapping for the staging buffer.

use std::{fs, path::Path, sync::atomic::{AtomicUsize, Ordering}};

use memmap2::MmapMut;

use crate::Result;

/// A writable mapping of an entire file.
///
/// The requested length is rounded up to a multiple of the page size and the
/// underlying file is resized to match. The mapping is shared, so the OS
/// writes dirty pages back even if the process dies without unmapping.
pub(crate) struct MappedFile {
    map: MmapMut,
    resized: bool,
}

impl MappedFile {
    pub(crate) fn create(path: &Path, len: usize) -> Result<Self> {
        let len = round_up_page(len);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let existing = file.metadata()?.len();
        let resized = existing != 0 && existing != len as u64;
        if existing != len as u64 {
            file.set_len(len as u64)?;
        }

        // SAFETY: the file stays owned by this process for the mapping's
        // lifetime; concurrent external mutation is excluded by the
        // one-writer-per-directory contract.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map, resized })
    }

    /// `true` when an existing buffer file had a different length — the
    /// halves of the previous run cannot be trusted then.
    #[inline]
    pub(crate) fn was_resized(&self) -> bool {
        self.resized
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

/// Rounds up to a multiple of the operating system's page size.
fn round_up_page(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    match PAGE_SIZE.load(Ordering::Acquire) {
        0 => {
            // SAFETY: plain sysconf query.
            let page = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } as usize;
            PAGE_SIZE.store(page, Ordering::Release);
            page
        }
        page => page,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs::File, io::Read};
    use tempfile::tempdir;

    #[test]
    fn test_rounds_up_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stage.buffer");

        let mut mapped = MappedFile::create(&path, page_size() + 1).unwrap();
        assert_eq!(mapped.len(), 2 * page_size());

        const SLICE: &[u8] = b"persisted";
        mapped.as_mut_slice()[..SLICE.len()].copy_from_slice(SLICE);
        drop(mapped);

        let mut file = File::open(&path).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 2 * page_size() as u64);
        let mut content = [0u8; SLICE.len()];
        file.read_exact(&mut content).unwrap();
        assert_eq!(&content, SLICE);
    }

    #[test]
    fn test_reopen_keeps_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stage.buffer");

        let mut mapped = MappedFile::create(&path, 4096).unwrap();
        mapped.as_mut_slice()[0..4].copy_from_slice(b"PNBF");
        drop(mapped);

        let mut reopened = MappedFile::create(&path, 4096).unwrap();
        assert_eq!(&reopened.as_mut_slice()[0..4], b"PNBF");
    }
}
