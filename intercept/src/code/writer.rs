/// Sequential byte emitter over a raw code buffer.
#[derive(Debug)]
pub struct CodeWriter {
    base: *mut u8,
    code: *mut u8,
    size: usize,
    pc: u64,
}

impl CodeWriter {
    /// # Safety
    /// `buffer` must be writable for `size` bytes for the writer's lifetime.
    pub unsafe fn new(buffer: *mut u8, size: usize) -> Self {
        unsafe { Self::at(buffer, size, buffer as u64) }
    }

    /// A writer whose output will execute at `pc` rather than at `buffer`.
    ///
    /// # Safety
    /// Same as [`CodeWriter::new`].
    pub unsafe fn at(buffer: *mut u8, size: usize, pc: u64) -> Self {
        Self {
            base: buffer,
            code: buffer,
            size,
            pc,
        }
    }

    pub fn offset(&self) -> usize {
        (self.code as usize).saturating_sub(self.base as usize)
    }

    /// Runtime address of the next byte written.
    pub fn pc(&self) -> u64 {
        self.pc + self.offset() as u64
    }

    fn can_write(&self, bytes: usize) -> bool {
        self.offset() + bytes <= self.size
    }

    pub unsafe fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.can_write(bytes.len()));
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code, bytes.len());
            self.code = self.code.add(bytes.len());
        }
    }

    pub unsafe fn put_u32_le(&mut self, val: u32) {
        unsafe { self.put_bytes(&val.to_le_bytes()) }
    }

    pub unsafe fn put_u64_le(&mut self, val: u64) {
        unsafe { self.put_bytes(&val.to_le_bytes()) }
    }

    /// Fill with `filler` until the offset is a multiple of `align`.
    pub unsafe fn pad_to(&mut self, align: usize, filler: &[u8]) {
        debug_assert!(!filler.is_empty());
        while self.offset() % align != 0 {
            let room = align - self.offset() % align;
            let chunk = &filler[..filler.len().min(room)];
            unsafe { self.put_bytes(chunk) };
        }
    }
}
