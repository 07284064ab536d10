//! Page Arena
//!
//! Each shard stores entry bytes in fixed-capacity pages. Writes are appended
//! at the active page's cursor; a page is never grown, copied or compacted.
//! When the active page cannot hold an entry it is sealed and a new page is
//! started, sized to the entry if the entry is larger than a standard page.
//!
//! ```text
//!   page 0 (sealed)         page 1 (sealed)         page 2 (active)
//! ┌───┬─────┬──┬──────┐   ┌────────┬───┬─────┐   ┌──────┬──┬───────────┐
//! │ a │ dead│b │ dead │   │  dead  │ c │dead │   │  d   │e │  free ... │
//! └───┴─────┴──┴──────┘   └────────┴───┴─────┘   └──────┴──┴─────▲─────┘
//!                                                               cursor
//! ```
//!
//! Dead bytes (deleted, overwritten or expired entries) stay in place until
//! vacuum finds a page with no live entries and reclaims it. A reclaimed page
//! hands its capacity back to the shared [`SizeBudget`] at once; standard-size
//! buffers are also kept in a small free pool so the next page can skip the
//! allocator. Only pages are charged, so an idle pool never holds budget that
//! another shard could use.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::{CacheError, Result};
use crate::storage::budget::SizeBudget;

/// Identifier of a page within one shard. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u64);

impl PageId {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Location of an entry's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub page: PageId,
    pub offset: usize,
    pub len: usize,
}

impl Span {
    #[inline]
    fn end(&self) -> usize {
        self.offset + self.len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Accepting appends
    Active,
    /// Full; reclaimable once no live entries remain
    Sealed,
}

#[derive(Debug)]
struct Page {
    buf: BytesMut,
    cursor: usize,
    state: PageState,
    live_entries: usize,
    live_bytes: usize,
}

impl Page {
    fn new(buf: BytesMut) -> Self {
        Self {
            buf,
            cursor: 0,
            state: PageState::Active,
            live_entries: 0,
            live_bytes: 0,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.capacity() - self.cursor
    }

    fn claim(&mut self, id: PageId, len: usize) -> Span {
        let span = Span {
            page: id,
            offset: self.cursor,
            len,
        };
        self.cursor += len;
        self.live_entries += 1;
        self.live_bytes += len;
        span
    }
}

/// Per-shard page storage.
#[derive(Debug)]
pub struct PageArena {
    pages: HashMap<PageId, Page>,
    active: Option<PageId>,
    free: Vec<BytesMut>,
    page_size: usize,
    max_free_pages: usize,
    next_id: u64,
    /// Page capacity charged to the budget
    resident: u64,
    budget: Arc<SizeBudget>,
}

impl PageArena {
    pub fn new(page_size: usize, max_free_pages: usize, budget: Arc<SizeBudget>) -> Self {
        Self {
            pages: HashMap::new(),
            active: None,
            free: Vec::new(),
            page_size,
            max_free_pages,
            next_id: 0,
            resident: 0,
            budget,
        }
    }

    /// Claims `size` bytes at the cursor of the active page.
    ///
    /// Starts a new page when the active one is too small. Fails with
    /// `NoSpace` if that page cannot be charged to the budget, in which case
    /// the arena is left untouched.
    pub fn allocate(&mut self, size: usize) -> Result<Span> {
        if let Some(id) = self.active {
            if let Some(page) = self.pages.get_mut(&id) {
                if page.remaining() >= size {
                    return Ok(page.claim(id, size));
                }
            }
        }

        let buf = self.fresh_buffer(size)?;
        let id = PageId(self.next_id);
        self.next_id += 1;

        if let Some(prev) = self.active.take() {
            if let Some(page) = self.pages.get_mut(&prev) {
                page.state = PageState::Sealed;
            }
        }

        let mut page = Page::new(buf);
        let span = page.claim(id, size);
        self.pages.insert(id, page);
        self.active = Some(id);
        Ok(span)
    }

    fn fresh_buffer(&mut self, size: usize) -> Result<BytesMut> {
        let capacity = size.max(self.page_size);
        self.budget.try_reserve(capacity as u64)?;
        self.resident += capacity as u64;

        let pooled = if capacity == self.page_size {
            self.free.pop()
        } else {
            None
        };
        Ok(pooled.unwrap_or_else(|| BytesMut::zeroed(capacity)))
    }

    /// Copies `data` into an allocated span.
    pub fn write(&mut self, span: Span, data: &[u8]) -> Result<()> {
        if span.len != data.len() {
            return Err(CacheError::Internal(format!(
                "span of {} bytes cannot hold {} bytes",
                span.len,
                data.len()
            )));
        }
        let page = self
            .pages
            .get_mut(&span.page)
            .ok_or_else(|| stale(span))?;
        if span.end() > page.cursor {
            return Err(stale(span));
        }
        page.buf[span.offset..span.end()].copy_from_slice(data);
        Ok(())
    }

    /// Returns the bytes of a span.
    pub fn read(&self, span: Span) -> Result<&[u8]> {
        let page = self.pages.get(&span.page).ok_or_else(|| stale(span))?;
        if span.end() > page.cursor {
            return Err(stale(span));
        }
        Ok(&page.buf[span.offset..span.end()])
    }

    /// Marks a span's bytes dead. The page keeps them until it is reclaimed.
    pub fn release(&mut self, span: Span) -> Result<()> {
        let page = self
            .pages
            .get_mut(&span.page)
            .ok_or_else(|| stale(span))?;
        if page.live_entries == 0 || span.end() > page.cursor {
            return Err(stale(span));
        }
        page.live_entries -= 1;
        page.live_bytes = page.live_bytes.saturating_sub(span.len);
        Ok(())
    }

    /// Pages holding no live entries, the active page included.
    pub fn reclaimable(&self) -> Vec<PageId> {
        self.pages
            .iter()
            .filter(|(_, page)| page.live_entries == 0)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drops an empty page and returns its capacity to the budget.
    ///
    /// Standard-size buffers are kept in the free pool when it has room.
    /// Returns the number of bytes handed back to the budget.
    pub fn reclaim(&mut self, id: PageId) -> Result<u64> {
        match self.pages.get(&id) {
            None => {
                return Err(CacheError::Internal(format!(
                    "page {} does not exist",
                    id.get()
                )))
            }
            Some(page) if page.live_entries > 0 => {
                return Err(CacheError::Internal(format!(
                    "page {} still holds {} live entries",
                    id.get(),
                    page.live_entries
                )))
            }
            Some(_) => {}
        }

        let page = match self.pages.remove(&id) {
            Some(page) => page,
            None => return Ok(0),
        };
        if self.active == Some(id) {
            self.active = None;
        }

        let capacity = page.capacity();
        self.budget.release(capacity as u64);
        self.resident -= capacity as u64;

        if capacity == self.page_size && self.free.len() < self.max_free_pages {
            self.free.push(page.buf);
        }
        Ok(capacity as u64)
    }

    /// Frees every page and pooled buffer. Returns the bytes released.
    pub fn clear(&mut self) -> u64 {
        let released = self.resident;
        self.pages.clear();
        self.free.clear();
        self.active = None;
        if released > 0 {
            self.budget.release(released);
        }
        self.resident = 0;
        released
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pooled_pages(&self) -> usize {
        self.free.len()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident
    }

    pub fn live_bytes(&self) -> u64 {
        self.pages.values().map(|p| p.live_bytes as u64).sum()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_state(&self, id: PageId) -> Option<PageState> {
        self.pages.get(&id).map(|p| p.state)
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        self.clear();
    }
}

fn stale(span: Span) -> CacheError {
    CacheError::Internal(format!(
        "stale reference: page {} offset {} len {}",
        span.page.get(),
        span.offset,
        span.len
    ))
}
