//! Per-I/O LIFO of (data, logical-size, buffer-size) frames (spec §4.3),
//! grounded on `zio_push_transform`/`zio_pop_transform`/
//! `zio_clear_transform_stack` in the original. Used symmetrically by
//! compression (push a compressed buffer; on read, pop it after
//! decompression writes into the outer buffer) and gang indirection (push
//! a GBH buffer for the intermediate stages; pop before dispatching
//! children).

use crate::buffer_pool::{Buf, BufferPool};

struct Frame {
    data: Vec<u8>,
    size: u64,
    bufsize: u64,
}

/// A stack of pending transforms applied to one `Zio`'s payload. Empty
/// until the constructor's initial `push` (every `Zio` starts with at
/// least one frame holding its original payload).
#[derive(Default)]
pub struct TransformStack {
    frames: Vec<Frame>,
}

impl TransformStack {
    pub fn new() -> Self {
        TransformStack { frames: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Pushes a new top frame, rebinding the caller's view of `(data, size)`
    /// to it. Returns the new top's `(size)` for the caller to store on the
    /// `Zio`.
    pub fn push(&mut self, data: Vec<u8>, size: u64, bufsize: u64) {
        self.frames.push(Frame { data, size, bufsize });
    }

    /// Pops the top frame, restoring the previous top as the caller's
    /// current view. Panics if the stack is empty — symmetric misuse is a
    /// programmer error, matching the original's unchecked
    /// `zt = zio->io_transform_stack; *data = zt->zt_data`.
    pub fn pop(&mut self) -> (Vec<u8>, u64, u64) {
        let frame = self.frames.pop().expect("transform stack underflow");
        (frame.data, frame.size, frame.bufsize)
    }

    /// Current top's data, if any.
    pub fn top_data(&self) -> Option<&[u8]> {
        self.frames.last().map(|f| f.data.as_slice())
    }

    /// Mutable access to the top frame's data, for a vdev read or a gang
    /// reassembly to fill in place without a push/pop round trip.
    pub fn top_data_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.frames.last_mut().map(|f| &mut f.data)
    }

    pub fn top_size(&self) -> Option<u64> {
        self.frames.last().map(|f| f.size)
    }

    /// Unwinds every frame above (and including) the bottom, freeing each
    /// popped buffer back to `pool`. Mirrors `zio_clear_transform_stack`,
    /// which frees every transform except the caller's original payload
    /// (left on the stack for the caller to manage). Invoked from `DONE`.
    pub fn unwind(&mut self, pool: &mut BufferPool) {
        while self.frames.len() > 1 {
            let frame = self.frames.pop().unwrap();
            pool.free(Buf::from_vec(frame.data));
            let _ = frame.bufsize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_restores_previous_frame() {
        let mut stack = TransformStack::new();
        stack.push(vec![1, 2, 3], 3, 3);
        stack.push(vec![9, 9], 2, 2);
        assert_eq!(stack.top_data(), Some(&[9, 9][..]));
        let (data, size, _) = stack.pop();
        assert_eq!(data, vec![9, 9]);
        assert_eq!(size, 2);
        assert_eq!(stack.top_data(), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn unwind_leaves_bottom_frame_and_recycles_rest() {
        let mut pool = BufferPool::new();
        let mut stack = TransformStack::new();
        stack.push(vec![0u8; 512], 512, 512);
        stack.push(vec![1u8; 512], 512, 512);
        stack.unwind(&mut pool);
        assert_eq!(stack.frames.len(), 1);
    }
}
