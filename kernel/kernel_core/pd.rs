//! Protection domains.
//!
//! A protection domain (Pd) is the capability-addressable container a cell
//! hangs off: it owns the worker-channel page shared with its user space
//! and the cell itself, and carries the page quota that channel allocation
//! draws from. Address-space plumbing (mapping the channel page at its
//! user-chosen virtual address) is delegated to the memory subsystem; this
//! module records the mapping request and hands out the kernel view.

use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, Once};

use cap::KernelObject;
use klog::klog;
use sched::{Cell, ChannelPage};

/// Errors raised by protection-domain operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdError {
    /// The channel page has already been set up.
    ChannelsExist,
    /// The domain's page quota is exhausted.
    QuotaExhausted,
}

/// A protection domain.
pub struct Pd {
    /// Pages this domain may still allocate from kernel memory.
    quota: AtomicUsize,
    /// Worker entry point recorded by `mxinit`.
    entry: AtomicU64,
    /// User virtual address the channel page is mapped at.
    channel_gva: AtomicU64,
    /// Kernel view of the channel page; set once by `mxinit`.
    channels: Once<Arc<ChannelPage>>,
    /// The cell attached to this domain, if any.
    cell: Mutex<Option<Arc<Cell>>>,
}

impl Pd {
    /// Create a domain with a page quota.
    pub fn new(quota: usize) -> Self {
        Self {
            quota: AtomicUsize::new(quota),
            entry: AtomicU64::new(0),
            channel_gva: AtomicU64::new(0),
            channels: Once::new(),
            cell: Mutex::new(None),
        }
    }

    /// Set up the worker-channel page and record the worker entry point.
    ///
    /// Allocates one page against the domain quota and publishes the
    /// kernel view; the memory subsystem maps it read/write at
    /// `channel_gva` in the domain's address space.
    pub fn mxinit(&self, entry: u64, channel_gva: u64) -> Result<Arc<ChannelPage>, PdError> {
        if self.channels.get().is_some() {
            return Err(PdError::ChannelsExist);
        }
        // One page for the channel array.
        if !self.charge_quota(1) {
            return Err(PdError::QuotaExhausted);
        }
        let page = self
            .channels
            .call_once(|| Arc::new(ChannelPage::new()))
            .clone();
        self.entry.store(entry, Ordering::Release);
        self.channel_gva.store(channel_gva, Ordering::Release);
        klog!(Info, "channel page mapped at {:#x}", channel_gva);
        Ok(page)
    }

    fn charge_quota(&self, pages: usize) -> bool {
        self.quota
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| {
                q.checked_sub(pages)
            })
            .is_ok()
    }

    /// Kernel view of the channel page, if `mxinit` has run.
    pub fn channels(&self) -> Option<Arc<ChannelPage>> {
        self.channels.get().cloned()
    }

    /// The worker entry point recorded by `mxinit`.
    pub fn entry(&self) -> u64 {
        self.entry.load(Ordering::Acquire)
    }

    /// The cell attached to this domain.
    pub fn cell(&self) -> Option<Arc<Cell>> {
        self.cell.lock().clone()
    }

    /// Attach a cell. Replacing an attached cell is a caller bug.
    pub fn set_cell(&self, cell: Arc<Cell>) {
        let mut guard = self.cell.lock();
        debug_assert!(guard.is_none(), "cell already attached");
        *guard = Some(cell);
    }
}

impl KernelObject for Pd {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        "Pd"
    }
}
