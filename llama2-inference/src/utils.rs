use crate::error::{LlamaError, Result};
use crate::tensor::{TensorSource, TensorView};
use memmap2::Mmap;
use std::fs::File;
use std::slice;

const F32_SIZE: usize = std::mem::size_of::<f32>();

/// Read-only memory mapping of a checkpoint with a sequential byte cursor.
///
/// Tensors are handed out as [`TensorView`]s (element offset + length) instead of
/// borrowed slices, so the mapping can be owned by the weight store together with
/// every view that points into it.
///
/// Floats are read in host byte order: checkpoints are little-endian and no
/// conversion happens on big-endian targets.
#[derive(Debug)]
pub(crate) struct MemoryMapper {
    mmap: Mmap,
    offset: usize,
}

impl MemoryMapper {
    pub fn new(file: File) -> Result<Self> {
        // SAFETY: the mapping is read-only and the checkpoint is not expected to be
        // modified by other processes while the model is alive.
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };

        if mmap.as_ptr().align_offset(std::mem::align_of::<f32>()) != 0 {
            return Err(LlamaError::InvalidCheckpoint("memory mapping is not aligned for f32 access".into()));
        }

        Ok(Self { mmap, offset: 0 })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn remaining(&self) -> usize {
        self.mmap.len() - self.offset
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&[u8]> {
        if count > self.remaining() {
            return Err(LlamaError::InvalidCheckpoint(format!(
                "insufficient data: need {} bytes, have {} remaining",
                count,
                self.remaining()
            )));
        }

        let result = &self.mmap[self.offset..self.offset + count];
        self.offset += count;
        Ok(result)
    }

    /// Takes the next `count` floats as a view and advances the cursor past them.
    pub fn take_f32(&mut self, count: usize) -> Result<TensorView> {
        let bytes_needed = count
            .checked_mul(F32_SIZE)
            .ok_or_else(|| LlamaError::InvalidCheckpoint(format!("tensor of {count} floats is too large")))?;

        if bytes_needed > self.remaining() {
            return Err(LlamaError::InvalidCheckpoint(format!(
                "insufficient data: need {} bytes, have {} remaining",
                bytes_needed,
                self.remaining()
            )));
        }

        if self.offset % F32_SIZE != 0 {
            return Err(LlamaError::InvalidCheckpoint(format!("tensor offset {} is not f32 aligned", self.offset)));
        }

        let view = TensorView::new(self.offset / F32_SIZE, count);
        self.offset += bytes_needed;
        Ok(view)
    }

    /// Advances the cursor by `count` floats without creating a view.
    pub fn skip_f32(&mut self, count: usize) -> Result<()> {
        let bytes = count
            .checked_mul(F32_SIZE)
            .filter(|&bytes| bytes <= self.remaining())
            .ok_or_else(|| LlamaError::InvalidCheckpoint(format!("cannot skip {count} floats: insufficient data")))?;
        self.offset += bytes;
        Ok(())
    }

    fn floats(&self) -> &[f32] {
        // SAFETY: the base pointer alignment was checked in `new`, the length is rounded
        // down to whole floats and every bit pattern is a valid f32.
        unsafe { slice::from_raw_parts(self.mmap.as_ptr() as *const f32, self.mmap.len() / F32_SIZE) }
    }
}

impl TensorSource for MemoryMapper {
    fn tensor(&self, view: TensorView) -> &[f32] {
        &self.floats()[view.range()]
    }
}
