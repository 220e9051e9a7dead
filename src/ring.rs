//! Bounded, timestamped output buffers, one per captured stream.

use std::{
    collections::VecDeque,
    io,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::misc::poison_error;

/// Which stream a ring item came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamTag {
    Out,
    Err,
    /// Terminal item; the payload is the exit status in decimal.
    Closed,
}

impl StreamTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Out => "out",
            Self::Err => "err",
            Self::Closed => "closed",
        }
    }
}

/// One captured chunk.
#[derive(Clone, Debug)]
pub struct Item {
    pub tag: StreamTag,
    pub timestamp: f64,
    pub payload: Vec<u8>,
}

/// Bounded FIFO of output chunks with drop-oldest eviction.
///
/// A ring is written by exactly one reaper task and read by any number of
/// watching sessions, so it carries its own lock. The kernel-wide lock is
/// never taken while a ring lock is held.
#[derive(Debug)]
pub struct OutputRing {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<Item>,
    bufsize: usize,
    used: usize,
    last_timestamp: f64,
    shut: bool,
}

/// Wall-clock seconds, clamped so that items within one ring never go
/// backwards even if the clock does.
fn stamp(inner: &mut Inner) -> f64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let ts = now.max(inner.last_timestamp);
    inner.last_timestamp = ts;
    ts
}

impl OutputRing {
    pub fn new(bufsize: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                bufsize,
                used: 0,
                last_timestamp: 0.0,
                shut: false,
            }),
        }
    }

    /// Appends one output chunk. A payload at least as large as the whole
    /// buffer evicts everything else and is held alone, keeping the most
    /// recent write visible; otherwise the oldest items are dropped until
    /// the new chunk fits.
    pub fn push(&self, tag: StreamTag, payload: Vec<u8>) -> io::Result<()> {
        let mut inner = self.inner.lock().map_err(poison_error)?;
        if inner.shut {
            return Ok(());
        }
        let timestamp = stamp(&mut inner);
        if payload.len() >= inner.bufsize {
            inner.items.clear();
            inner.used = payload.len();
        } else {
            inner.used += payload.len();
            while inner.used > inner.bufsize {
                match inner.items.pop_front() {
                    Some(first) => inner.used -= item_len(&first),
                    None => break,
                }
            }
        }
        inner.items.push_back(Item { tag, timestamp, payload });
        Ok(())
    }

    /// Appends the terminal item. Closed items are exempt from the size
    /// accounting.
    pub fn push_closed(&self, status: i32) -> io::Result<()> {
        let mut inner = self.inner.lock().map_err(poison_error)?;
        if inner.shut {
            return Ok(());
        }
        let timestamp = stamp(&mut inner);
        inner.items.push_back(Item {
            tag: StreamTag::Closed,
            timestamp,
            payload: status.to_string().into_bytes(),
        });
        Ok(())
    }

    /// Snapshots the current contents together with the newest timestamp,
    /// or `None` when the ring is empty. Nothing is consumed; the watcher
    /// comes back with [`remove`](Self::remove) once its client has
    /// acknowledged the batch.
    pub fn retrieve(&self) -> io::Result<Option<(f64, Vec<Item>)>> {
        let inner = self.inner.lock().map_err(poison_error)?;
        Ok(inner
            .items
            .back()
            .map(|last| (last.timestamp, inner.items.iter().cloned().collect())))
    }

    /// Discards every item with a timestamp at or before `timestamp`.
    pub fn remove(&self, timestamp: f64) -> io::Result<()> {
        let mut inner = self.inner.lock().map_err(poison_error)?;
        while let Some(front) = inner.items.front() {
            if front.timestamp > timestamp {
                break;
            }
            let len = item_len(front);
            inner.items.pop_front();
            inner.used = inner.used.saturating_sub(len);
        }
        Ok(())
    }

    /// Shuts the ring: the contents are discarded and every later push
    /// becomes a no-op.
    pub fn close(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().map_err(poison_error)?;
        inner.items = VecDeque::new();
        inner.bufsize = 0;
        inner.used = 0;
        inner.shut = true;
        Ok(())
    }
}

fn item_len(item: &Item) -> usize {
    match item.tag {
        StreamTag::Closed => 0,
        _ => item.payload.len(),
    }
}
