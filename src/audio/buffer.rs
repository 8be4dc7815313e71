//! Planar PCM scratch buffers
//!
//! A `PcmChunk` is the transport between a decoder and the ring buffer, and
//! between the ring buffer and the format converter: one plane of f32
//! samples per channel, sized for a fixed frame capacity at allocation time
//! and reused for every transfer.

/// Fixed-capacity planar sample buffer
#[derive(Debug, Clone)]
pub struct PcmChunk {
    planes: Vec<Vec<f32>>,
    capacity: usize,
    frames: usize,
}

impl PcmChunk {
    /// Allocate a chunk with `capacity` frames per channel, zero-filled
    pub fn new(channels: u16, capacity: usize) -> Self {
        let planes = vec![vec![0.0; capacity]; channels as usize];
        Self {
            planes,
            capacity,
            frames: 0,
        }
    }

    /// Channel count
    pub fn channels(&self) -> u16 {
        self.planes.len() as u16
    }

    /// Frame capacity per channel
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Valid frames currently held
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Set the valid frame count after writing samples
    ///
    /// Clamped to the allocated capacity.
    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity);
    }

    /// Discard contents in preparation for the next transfer
    pub fn reset(&mut self) {
        self.frames = 0;
    }

    /// Samples of one channel, valid frames only
    pub fn plane(&self, channel: usize) -> &[f32] {
        &self.planes[channel][..self.frames]
    }

    /// Writable samples of one channel, full capacity
    pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
        &mut self.planes[channel]
    }

    /// Fill `frames` frames of every channel with silence and mark them valid
    pub fn fill_silence(&mut self, frames: usize) {
        let frames = frames.min(self.capacity);
        for plane in &mut self.planes {
            plane[..frames].fill(0.0);
        }
        self.frames = frames;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_allocation() {
        let chunk = PcmChunk::new(2, 256);
        assert_eq!(chunk.channels(), 2);
        assert_eq!(chunk.capacity(), 256);
        assert_eq!(chunk.frames(), 0);
    }

    #[test]
    fn test_write_and_read_back() {
        let mut chunk = PcmChunk::new(2, 8);
        chunk.plane_mut(0)[..3].copy_from_slice(&[0.1, 0.2, 0.3]);
        chunk.plane_mut(1)[..3].copy_from_slice(&[-0.1, -0.2, -0.3]);
        chunk.set_frames(3);

        assert_eq!(chunk.frames(), 3);
        assert_eq!(chunk.plane(0), &[0.1, 0.2, 0.3]);
        assert_eq!(chunk.plane(1), &[-0.1, -0.2, -0.3]);
    }

    #[test]
    fn test_set_frames_clamps_to_capacity() {
        let mut chunk = PcmChunk::new(1, 4);
        chunk.set_frames(100);
        assert_eq!(chunk.frames(), 4);
    }

    #[test]
    fn test_fill_silence() {
        let mut chunk = PcmChunk::new(2, 8);
        chunk.plane_mut(0).fill(0.5);
        chunk.fill_silence(4);

        assert_eq!(chunk.frames(), 4);
        assert_eq!(chunk.plane(0), &[0.0; 4]);
    }

    #[test]
    fn test_reset_clears_valid_length() {
        let mut chunk = PcmChunk::new(1, 8);
        chunk.set_frames(5);
        chunk.reset();
        assert_eq!(chunk.frames(), 0);
    }
}
