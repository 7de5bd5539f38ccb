//! Platform implementations of the readable-memory capability.
//!
//! The object classifier follows candidate method-table pointers into
//! arbitrary process memory, so it needs a way to ask the operating system
//! whether an address range is mapped before touching it. These probes
//! answer at page granularity: "mapped" is not exactly "readable" (a
//! `PROT_NONE` mapping will still fault), but it removes the overwhelmingly
//! common failure mode of chasing an integer that is not a pointer at all.

use crate::hooks::MemoryProbe;

/// Probe that trusts every address.
///
/// Only suitable where all candidate pointers are known to reference live
/// memory, such as tests that hand-craft classification inputs. Installing
/// it in a real process turns classification into a crash hazard.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysReadable;

impl MemoryProbe for AlwaysReadable {
    fn is_readable(&self, _address: usize, _len: usize) -> bool {
        true
    }
}

/// Page-map probe backed by the operating system.
///
/// On Linux this asks `mincore(2)`, which fails with `ENOMEM` for unmapped
/// ranges; on other unix platforms it falls back to `msync(2)`, which
/// reports the same condition. There is no Windows implementation in this
/// crate; a `VirtualQuery`-based probe can be injected through the
/// [`MemoryProbe`] trait from outside.
#[cfg(unix)]
#[derive(Debug)]
pub struct PageMapProbe {
    page_size: usize,
}

#[cfg(unix)]
impl PageMapProbe {
    /// Creates a probe, reading the page size from the system.
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: sysconf is always safe to call.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: usize::try_from(page_size).unwrap_or(4096),
        }
    }

    fn page_is_mapped(&self, page: usize) -> bool {
        #[cfg(target_os = "linux")]
        {
            let mut residency = [0_u8; 1];
            // SAFETY: `page` is page-aligned and we pass a length within one
            // page with a correctly sized residency vector. mincore does not
            // dereference unmapped memory; it fails with ENOMEM instead.
            let rc = unsafe {
                libc::mincore(
                    std::ptr::with_exposed_provenance_mut(page),
                    self.page_size,
                    residency.as_mut_ptr().cast(),
                )
            };
            rc == 0
        }
        #[cfg(not(target_os = "linux"))]
        {
            // SAFETY: msync with MS_ASYNC performs no write-back that could
            // block; it fails with ENOMEM when the range is not mapped.
            let rc = unsafe {
                libc::msync(
                    std::ptr::with_exposed_provenance_mut(page),
                    self.page_size,
                    libc::MS_ASYNC,
                )
            };
            rc == 0
        }
    }
}

#[cfg(unix)]
impl Default for PageMapProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl MemoryProbe for PageMapProbe {
    fn is_readable(&self, address: usize, len: usize) -> bool {
        if address == 0 || len == 0 {
            return false;
        }
        let Some(end) = address.checked_add(len - 1) else {
            return false;
        };

        let mut page = address - (address % self.page_size);
        let last_page = end - (end % self.page_size);
        loop {
            if !self.page_is_mapped(page) {
                return false;
            }
            if page == last_page {
                return true;
            }
            page += self.page_size;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn mapped_memory_is_readable() {
        let probe = PageMapProbe::new();
        let local = [0_u8; 64];
        assert!(probe.is_readable(local.as_ptr().expose_provenance(), local.len()));
    }

    #[test]
    fn null_and_empty_ranges_are_not_readable() {
        let probe = PageMapProbe::new();
        let local = 0_u8;
        assert!(!probe.is_readable(0, 16));
        assert!(!probe.is_readable(std::ptr::from_ref(&local).expose_provenance(), 0));
    }

    #[test]
    fn heap_memory_is_readable() {
        let probe = PageMapProbe::new();
        let buffer = vec![0_u8; 4096 * 3];
        assert!(probe.is_readable(buffer.as_ptr().expose_provenance(), buffer.len()));
    }
}
