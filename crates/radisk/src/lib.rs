//! Persistent layer over the radix tree.
//!
//! A radisk directory holds arbitrarily many keys packed into size-capped
//! files. Writes accumulate in an in-memory batch tree and are flushed on
//! an idle timer or when the batch outgrows its byte threshold; a flush
//! merges the batch into the affected files, slicing any file that would
//! exceed the size cap into contiguous chunks named by their smallest key.
//! The first file is always named `!`. Reads overlay the unflushed batch
//! on top of the on-disk image, so a writer always sees its own writes.
//!
//! The struct is a single mutator: one owner stages, flushes and reads;
//! there is no interior locking.

use core::time::Duration;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

use mesh_radix::{Filter, RadixTree};

mod encoding;
mod names;

pub use encoding::{encode_record, encode_tree, parse, Cell, ParseError, ETX, RS, US};
pub use names::{decode_name, encode_name, FIRST_FILE};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RadiskError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("file {name:?} is corrupt: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: ParseError,
    },
    #[error("file {0:?} has an undecodable name")]
    BadFileName(String),
}

/// Tuning knobs; see the configuration table in the node crate for the
/// user-facing defaults.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RadiskOptions {
    /// Directory holding the packed files.
    pub dir: Utf8PathBuf,
    /// Max bytes per file before slicing.
    pub size: usize,
    /// Batch byte threshold that forces an early flush.
    pub batch: usize,
    /// Idle interval between flushes.
    pub write: Duration,
    /// Keep decoded file trees in memory.
    pub cache: bool,
}

impl RadiskOptions {
    #[must_use]
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            size: 1024 * 1024,
            batch: 10 * 1024,
            write: Duration::from_millis(1),
            cache: true,
        }
    }
}

/// Cheap counters, readable at any time.
#[derive(Clone, Copy, Debug, Default)]
pub struct RadiskStats {
    pub flushes: u64,
    pub files_written: u64,
    pub slices: u64,
}

/// The persistence engine. See the module docs for the write discipline.
#[derive(Debug)]
pub struct Radisk {
    opts: RadiskOptions,
    /// Unflushed writes.
    batch: RadixTree<Cell>,
    /// Approximate encoded size of the batch.
    batch_bytes: usize,
    /// Set when the batch is non-empty; drives the flush timer.
    dirty_since: Option<Instant>,
    /// Smallest key of each file -> file name on disk.
    index: BTreeMap<Vec<u8>, String>,
    /// Decoded file trees, keyed by file name. Only filled when
    /// `opts.cache` is set.
    cache: HashMap<String, RadixTree<Cell>>,
    stats: RadiskStats,
}

impl Radisk {
    /// Open (creating if needed) a radisk directory and build the file
    /// index from the names found there.
    pub async fn open(opts: RadiskOptions) -> Result<Self, RadiskError> {
        tokio::fs::create_dir_all(&opts.dir).await?;

        let mut index = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&opts.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let start = decode_name(&name).ok_or_else(|| RadiskError::BadFileName(name.clone()))?;
            let _ = index.insert(start, name);
        }

        debug!(dir = %opts.dir, files = index.len(), "radisk opened");

        Ok(Self {
            opts,
            batch: RadixTree::new(),
            batch_bytes: 0,
            dirty_since: None,
            index,
            cache: HashMap::new(),
            stats: RadiskStats::default(),
        })
    }

    #[must_use]
    pub fn stats(&self) -> RadiskStats {
        self.stats
    }

    #[must_use]
    pub fn options(&self) -> &RadiskOptions {
        &self.opts
    }

    /// When the pending batch should be flushed, if anything is pending.
    #[must_use]
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.dirty_since.map(|since| since + self.opts.write)
    }

    /// Stage a write. Flushes inline when the batch outgrows its byte
    /// threshold; otherwise the caller drives flushing via
    /// [`Self::flush_deadline`] and [`Self::flush`].
    pub async fn write(&mut self, key: &[u8], cell: Cell) -> Result<(), RadiskError> {
        let mut scratch = Vec::new();
        self.batch_bytes += encode_record(&[], key, &cell, &mut scratch);
        let _ = self.batch.set(key, cell);
        self.dirty_since.get_or_insert_with(Instant::now);

        if self.batch_bytes >= self.opts.batch {
            self.flush().await?;
        }
        Ok(())
    }

    /// Exact read: batch overlay first, then the candidate file.
    pub async fn read(&mut self, key: &[u8]) -> Result<Option<Cell>, RadiskError> {
        if let Some(cell) = self.batch.get(key) {
            return Ok(Some(cell.clone()));
        }
        let Some(name) = self.candidate(key) else {
            return Ok(None);
        };
        let tree = self.load(&name).await?;
        Ok(tree.get(key).cloned())
    }

    /// Ordered range read across files, batch overlaid.
    pub async fn range(&mut self, filter: &Filter<'_>) -> Result<Vec<(Vec<u8>, Cell)>, RadiskError> {
        let mut merged: BTreeMap<Vec<u8>, Cell> = BTreeMap::new();

        for name in self.files_for(filter) {
            let tree = self.load(&name).await?;
            let _ = tree.range(filter, |key, cell| {
                let _ = merged.insert(key.to_vec(), cell.clone());
                core::ops::ControlFlow::<()>::Continue(())
            });
        }

        let _ = self.batch.range(filter, |key, cell| {
            let _ = merged.insert(key.to_vec(), cell.clone());
            core::ops::ControlFlow::<()>::Continue(())
        });

        Ok(merged.into_iter().collect())
    }

    /// Merge the batch into the affected files, slicing oversize results.
    pub async fn flush(&mut self) -> Result<(), RadiskError> {
        if self.batch.is_empty() {
            self.dirty_since = None;
            return Ok(());
        }

        let batch = core::mem::take(&mut self.batch);
        self.batch_bytes = 0;
        self.dirty_since = None;
        self.stats.flushes += 1;

        // Group staged entries by the file whose range holds their key.
        let mut groups: BTreeMap<Vec<u8>, Vec<(Vec<u8>, Cell)>> = BTreeMap::new();
        let _ = batch.map(|key, cell| {
            let start = self
                .index
                .range(..=key.to_vec())
                .next_back()
                .map(|(start, _)| start.clone())
                .unwrap_or_default();
            groups
                .entry(start)
                .or_default()
                .push((key.to_vec(), cell.clone()));
            core::ops::ControlFlow::<()>::Continue(())
        });

        for (start, entries) in groups {
            self.flush_group(&start, entries).await?;
        }

        Ok(())
    }

    async fn flush_group(
        &mut self,
        start: &[u8],
        entries: Vec<(Vec<u8>, Cell)>,
    ) -> Result<(), RadiskError> {
        let name = self
            .index
            .get(start)
            .cloned()
            .unwrap_or_else(|| FIRST_FILE.to_owned());

        let mut tree = if self.index.contains_key(start) {
            match self.load(&name).await {
                Ok(tree) => tree,
                // A corrupt image reads as missing; the staged writes win.
                Err(RadiskError::Corrupt { .. }) => RadixTree::new(),
                Err(err) => return Err(err),
            }
        } else {
            RadixTree::new()
        };
        for (key, cell) in entries {
            let _ = tree.set(&key, cell);
        }

        let image = encode_tree(&tree);
        if image.len() <= self.opts.size {
            self.store(&name, start, &image, &tree).await?;
            return Ok(());
        }

        // Slice into contiguous chunks that respect the cap. A single
        // record larger than the cap still becomes its own (oversize)
        // file rather than being split or dropped.
        let mut chunks: Vec<(Vec<u8>, Vec<u8>, RadixTree<Cell>)> = Vec::new();
        let mut image = Vec::new();
        let mut chunk = RadixTree::new();
        let mut first_key: Option<Vec<u8>> = None;
        let mut prev = Vec::new();
        let mut scratch = Vec::new();

        let _ = tree.map(|key, cell| {
            scratch.clear();
            let record_len = encode_record(&prev, key, cell, &mut scratch);
            if !image.is_empty() && image.len() + record_len > self.opts.size {
                chunks.push((
                    first_key.take().unwrap_or_default(),
                    core::mem::take(&mut image),
                    core::mem::take(&mut chunk),
                ));
                prev.clear();
                scratch.clear();
                let _ = encode_record(&prev, key, cell, &mut scratch);
            }
            if first_key.is_none() {
                first_key = Some(key.to_vec());
            }
            image.extend_from_slice(&scratch);
            let _ = chunk.set(key, cell.clone());
            prev.clear();
            prev.extend_from_slice(key);
            core::ops::ControlFlow::<()>::Continue(())
        });
        if !image.is_empty() {
            chunks.push((first_key.take().unwrap_or_default(), image, chunk));
        }

        self.stats.slices += chunks.len().saturating_sub(1) as u64;
        debug!(file = %name, chunks = chunks.len(), "slicing oversize file");

        for (i, (chunk_start, image, chunk)) in chunks.into_iter().enumerate() {
            // The first chunk keeps the existing file name so readers and
            // the index stay stable; later chunks are named by their
            // smallest key.
            let (chunk_name, chunk_index_key) = if i == 0 {
                (name.clone(), start.to_vec())
            } else {
                (encode_name(&chunk_start), chunk_start)
            };
            self.store(&chunk_name, &chunk_index_key, &image, &chunk)
                .await?;
        }

        Ok(())
    }

    async fn store(
        &mut self,
        name: &str,
        index_key: &[u8],
        image: &[u8],
        tree: &RadixTree<Cell>,
    ) -> Result<(), RadiskError> {
        tokio::fs::write(self.path(name), image).await?;
        let _ = self.index.insert(index_key.to_vec(), name.to_owned());
        if self.opts.cache {
            let _ = self.cache.insert(name.to_owned(), tree.clone());
        } else {
            let _ = self.cache.remove(name);
        }
        self.stats.files_written += 1;
        Ok(())
    }

    fn path(&self, name: &str) -> Utf8PathBuf {
        self.opts.dir.join(name)
    }

    /// The file whose range contains `key`, if any file exists yet.
    fn candidate(&self, key: &[u8]) -> Option<String> {
        self.index
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, name)| name.clone())
    }

    /// Files whose key range can intersect the filter.
    fn files_for(&self, filter: &Filter<'_>) -> Vec<String> {
        let (lo, hi) = filter_bounds(filter);

        let mut names = Vec::new();
        let mut iter = self.index.iter().peekable();
        while let Some((start, name)) = iter.next() {
            let next_start = iter.peek().map(|(start, _)| start.as_slice());
            // A file covers [start, next_start). It can serve the filter
            // unless it ends before the lower bound or starts after the
            // upper bound.
            if let (Some(lo), Some(next)) = (lo.as_deref(), next_start) {
                if next <= lo {
                    continue;
                }
            }
            if let Some(hi) = hi.as_deref() {
                if start.as_slice() > hi {
                    break;
                }
            }
            names.push(name.clone());
        }
        names
    }

    async fn load(&mut self, name: &str) -> Result<RadixTree<Cell>, RadiskError> {
        if let Some(tree) = self.cache.get(name) {
            return Ok(tree.clone());
        }

        let bytes = tokio::fs::read(self.path(name)).await?;
        let tree = parse(&bytes).map_err(|source| {
            warn!(file = %name, %source, "radisk file failed to parse");
            RadiskError::Corrupt {
                name: name.to_owned(),
                source,
            }
        })?;

        if self.opts.cache {
            let _ = self.cache.insert(name.to_owned(), tree.clone());
        }
        Ok(tree)
    }
}

/// Byte bounds implied by a filter, for file selection. `None` means
/// unbounded on that side.
fn filter_bounds(filter: &Filter<'_>) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    match *filter {
        Filter::Exact(key) => (Some(key.to_vec()), Some(key.to_vec())),
        Filter::Prefix(prefix) => (Some(prefix.to_vec()), prefix_upper(prefix)),
        Filter::Range { lo, hi } => (lo.map(<[u8]>::to_vec), hi.map(<[u8]>::to_vec)),
    }
}

/// The smallest byte string greater than every key starting with `prefix`,
/// or `None` when no such bound exists (all-0xFF prefixes).
fn prefix_upper(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(&last) = upper.last() {
        if last == u8::MAX {
            let _ = upper.pop();
        } else {
            *upper.last_mut().expect("checked non-empty") = last + 1;
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests;
