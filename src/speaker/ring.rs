//! Byte-addressed ring buffer plus the monotonic write/play offset pair.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

pub struct AudioRing {
    producer: HeapProd<u8>,
    consumer: HeapCons<u8>,
    capacity: usize,
    write_offset: u64,
    play_offset: u64,
}

impl AudioRing {
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = HeapRb::<u8>::new(capacity).split();
        Self { producer, consumer, capacity, write_offset: 0, play_offset: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub fn play_offset(&self) -> u64 {
        self.play_offset
    }

    pub fn buffered_bytes(&self) -> usize {
        (self.write_offset - self.play_offset) as usize
    }

    /// Pushes as much of `bytes` as fits; returns the number of bytes
    /// actually admitted. The remainder is the overrun discard.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let admitted = self.producer.push_slice(bytes);
        self.write_offset += admitted as u64;
        admitted
    }

    /// Pops up to `max` bytes, advancing `play_offset` by however many
    /// were actually available.
    pub fn pop(&mut self, max: usize) -> Vec<u8> {
        let available = self.consumer.occupied_len().min(max);
        let mut out = vec![0u8; available];
        let popped = self.consumer.pop_slice(&mut out);
        out.truncate(popped);
        self.play_offset += popped as u64;
        out
    }

    /// Drops up to `max` bytes without handing them anywhere (used while
    /// IDLE/PENDING to fast-forward past audio that arrived before the
    /// stream was armed to play, see speaker::mod design notes).
    pub fn skip(&mut self, max: usize) -> usize {
        let mut scratch = vec![0u8; max.min(self.consumer.occupied_len())];
        let popped = self.consumer.pop_slice(&mut scratch);
        self.play_offset += popped as u64;
        popped
    }

    /// Barge-in: drop all buffered bytes and reset both offsets to zero.
    pub fn reset(&mut self) {
        self.consumer.clear();
        self.write_offset = 0;
        self.play_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_tracks_offsets() {
        let mut ring = AudioRing::new(16);
        assert_eq!(ring.push(b"hello"), 5);
        assert_eq!(ring.write_offset(), 5);
        assert_eq!(ring.buffered_bytes(), 5);
        let popped = ring.pop(3);
        assert_eq!(popped, b"hel");
        assert_eq!(ring.play_offset(), 3);
        assert_eq!(ring.buffered_bytes(), 2);
    }

    #[test]
    fn push_beyond_capacity_is_truncated() {
        let mut ring = AudioRing::new(4);
        let admitted = ring.push(b"abcdefgh");
        assert_eq!(admitted, 4);
        assert_eq!(ring.write_offset(), 4);
    }

    #[test]
    fn reset_zeroes_both_offsets() {
        let mut ring = AudioRing::new(16);
        ring.push(b"hello world");
        ring.pop(4);
        ring.reset();
        assert_eq!(ring.write_offset(), 0);
        assert_eq!(ring.play_offset(), 0);
        assert_eq!(ring.buffered_bytes(), 0);
    }
}
