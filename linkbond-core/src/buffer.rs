//! Backup sender replay buffer.
//!
//! Backup groups keep every sent message until the peer acknowledges it, so
//! that a freshly activated standby link can replay the unacknowledged tail
//! under the originally assigned sequence numbers. Payloads live in
//! fixed-size blocks drawn from a bounded pool; a block returns to the pool
//! when its message is trimmed.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::GroupError;
use crate::msg::MsgControl;
use crate::seq::MsgNo;

/// Spare blocks kept beyond this count are released to the allocator.
const POOL_MAX_SPARE: usize = 32;

/// Bounded pool of fixed-size payload blocks.
pub(crate) struct BlockPool {
    block_size: usize,
    max_spare: usize,
    spare: Mutex<Vec<Box<[u8]>>>,
}

impl BlockPool {
    pub fn new(block_size: usize) -> Arc<BlockPool> {
        Arc::new(BlockPool {
            block_size,
            max_spare: POOL_MAX_SPARE,
            spare: Mutex::new(Vec::new()),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn get(self: &Arc<Self>) -> Block {
        let mut spare = self.spare.lock().unwrap_or_else(PoisonError::into_inner);
        let buf = spare
            .pop()
            .unwrap_or_else(|| vec![0u8; self.block_size].into_boxed_slice());
        Block {
            pool: Arc::clone(self),
            buf: Some(buf),
        }
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut spare = self.spare.lock().unwrap_or_else(PoisonError::into_inner);
        if spare.len() < self.max_spare {
            spare.push(buf);
        }
    }

    #[cfg(test)]
    fn spare_count(&self) -> usize {
        self.spare
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One pooled payload block; returns to its pool on drop.
pub(crate) struct Block {
    pool: Arc<BlockPool>,
    buf: Option<Box<[u8]>>,
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// One buffered message awaiting acknowledgment.
pub(crate) struct BufferedMessage {
    pub ctrl: MsgControl,
    data: Block,
    size: usize,
}

impl BufferedMessage {
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.size]
    }
}

/// Deque of recent messages, ordered by assignment, trimmed by ACKs.
pub(crate) struct SenderBuffer {
    pool: Arc<BlockPool>,
    queue: VecDeque<BufferedMessage>,
    /// Message number of the oldest buffered entry; `NONE` when empty.
    oldest_msg: MsgNo,
    /// Newest acknowledged message number; `NONE` before the first ACK.
    acked_msg: MsgNo,
    max_messages: usize,
}

impl SenderBuffer {
    pub fn new(block_size: usize, max_messages: usize) -> SenderBuffer {
        SenderBuffer {
            pool: BlockPool::new(block_size),
            queue: VecDeque::new(),
            oldest_msg: MsgNo::NONE,
            acked_msg: MsgNo::NONE,
            max_messages,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn oldest_msg(&self) -> MsgNo {
        self.oldest_msg
    }

    pub fn acked_msg(&self) -> MsgNo {
        self.acked_msg
    }

    /// Buffer one message before it is transmitted.
    ///
    /// Overflow means ACKs have stopped progressing; the caller treats that
    /// as fatal rather than silently dropping history.
    pub fn push(&mut self, ctrl: MsgControl, payload: &[u8]) -> Result<(), GroupError> {
        if payload.len() > self.pool.block_size() {
            return Err(GroupError::InvalidParam("payload exceeds buffer block size"));
        }
        if self.queue.len() >= self.max_messages {
            return Err(GroupError::ResourceExhausted);
        }
        let mut data = self.pool.get();
        data[..payload.len()].copy_from_slice(payload);
        if self.queue.is_empty() {
            self.oldest_msg = ctrl.msgno;
        }
        self.queue.push_back(BufferedMessage {
            ctrl,
            data,
            size: payload.len(),
        });
        Ok(())
    }

    /// Record an ACK and drop entries strictly older than it.
    ///
    /// Returns the number of entries trimmed. A regressing ACK is ignored.
    pub fn ack(&mut self, msgno: MsgNo) -> usize {
        if msgno.is_none() {
            return 0;
        }
        if !self.acked_msg.is_none() && !self.acked_msg.precedes(msgno) {
            debug!(acked = self.acked_msg.raw(), msgno = msgno.raw(), "stale ack ignored");
            return 0;
        }
        self.acked_msg = msgno;
        self.trim(false)
    }

    /// Trim entries covered by the current ACK state. With `inclusive`, the
    /// entry equal to the acked message number goes too (send-path
    /// maintenance); without it, that entry stays as the oldest boundary.
    pub fn trim(&mut self, inclusive: bool) -> usize {
        if self.acked_msg.is_none() {
            return 0;
        }
        let mut dropped = 0;
        while let Some(front) = self.queue.front() {
            let covered = if inclusive {
                !self.acked_msg.precedes(front.ctrl.msgno)
            } else {
                front.ctrl.msgno.precedes(self.acked_msg)
            };
            if !covered {
                break;
            }
            self.queue.pop_front();
            dropped += 1;
        }
        self.oldest_msg = self
            .queue
            .front()
            .map(|m| m.ctrl.msgno)
            .unwrap_or(MsgNo::NONE);
        dropped
    }

    /// Entries a freshly activated link must replay: everything newer than
    /// the acked message, oldest first, under the original numbers.
    pub fn replay(&self) -> impl Iterator<Item = &BufferedMessage> {
        let acked = self.acked_msg;
        self.queue
            .iter()
            .filter(move |m| acked.is_none() || acked.precedes(m.ctrl.msgno))
    }
}
