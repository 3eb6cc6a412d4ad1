//! Bounded queues between pipeline stages.
//!
//! The export side is a lossy single-producer/single-consumer queue: the
//! cache never blocks on push, and records that do not fit are dropped and
//! counted. The input side recycles preallocated packet blocks through a
//! pair of bounded channels, so the capture worker reuses buffers the
//! storage worker has finished with.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{Receiver, Sender, bounded};
use crossbeam::queue::ArrayQueue;

use crate::flow::Flow;
use crate::packet::{PacketBlock, PacketRecord};

/// Record handed from the cache to the exporter.
#[derive(Debug)]
pub enum ExportItem {
    Flow(Box<Flow>),
    Packet(PacketRecord),
}

/// Lossy bounded queue of records awaiting export.
pub struct FlowRing {
    queue: ArrayQueue<ExportItem>,
    dropped: AtomicU64,
}

impl FlowRing {
    pub fn new(capacity: usize) -> FlowRing {
        FlowRing {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Never blocks. A record that does not fit is dropped and counted.
    pub fn push(&self, item: ExportItem) -> bool {
        match self.queue.push(item) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<ExportItem> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Records lost to exporter back-pressure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Block-recycling channel pair between one capture worker and its
/// storage worker. `free` starts full; the producer takes an empty block,
/// fills it and sends it through `full`; the consumer hands it back.
pub struct BlockPipe {
    pub full_tx: Sender<PacketBlock>,
    pub full_rx: Receiver<PacketBlock>,
    pub free_tx: Sender<PacketBlock>,
    pub free_rx: Receiver<PacketBlock>,
}

impl BlockPipe {
    pub fn new(depth: usize, block_size: usize) -> BlockPipe {
        // One block more than the queue depth so the producer always has
        // a block to fill while the queue is at capacity.
        let blocks = depth + 1;
        let (full_tx, full_rx) = bounded(blocks);
        let (free_tx, free_rx) = bounded(blocks);
        for _ in 0..blocks {
            free_tx
                .send(PacketBlock::new(block_size))
                .expect("free queue sized for all blocks");
        }
        BlockPipe {
            full_tx,
            full_rx,
            free_tx,
            free_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_lossy_when_full() {
        let ring = FlowRing::new(2);
        assert!(ring.push(ExportItem::Flow(Box::default())));
        assert!(ring.push(ExportItem::Flow(Box::default())));
        assert!(!ring.push(ExportItem::Flow(Box::default())));
        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn block_pipe_recycles() {
        let pipe = BlockPipe::new(2, 4);
        let mut block = pipe.free_rx.recv().unwrap();
        block.cnt = 1;
        pipe.full_tx.send(block).unwrap();

        let mut block = pipe.full_rx.recv().unwrap();
        assert_eq!(block.cnt, 1);
        block.clear();
        pipe.free_tx.send(block).unwrap();
        assert_eq!(pipe.free_rx.len(), 3);
    }
}
