//! Executable memory backing one code block.
//!
//! Blocks are RW while being written and RX while running. On unix targets
//! the buffer is an anonymous page-aligned mapping flipped with `mprotect`;
//! elsewhere a plain heap buffer stands in, which behaves like the platforms
//! whose pages are always RWX: there only the instruction cache would need
//! invalidating, and the reference backend reads through the data path, so
//! that hook is a no-op.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use rustix::mm::{mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags};

        pub(crate) struct CodeBlock {
            ptr: *mut u8,
            len: usize,
            rx: bool,
        }

        impl CodeBlock {
            pub fn new(size: usize) -> Self {
                // The kernel backs this with whole pages either way; the
                // block only ever uses the bytes it asked for.
                let ptr = unsafe {
                    mmap_anonymous(
                        std::ptr::null_mut(),
                        size,
                        ProtFlags::READ | ProtFlags::WRITE,
                        MapFlags::PRIVATE,
                    )
                }
                .expect("failed to map code block");
                Self {
                    ptr: ptr.cast(),
                    len: size,
                    rx: false,
                }
            }

            pub fn len(&self) -> usize {
                self.len
            }

            pub fn is_rx(&self) -> bool {
                self.rx
            }

            pub fn make_rx(&mut self) {
                unsafe {
                    mprotect(self.ptr.cast(), self.len, MprotectFlags::READ | MprotectFlags::EXEC)
                }
                .expect("failed to publish code block");
                self.rx = true;
            }

            pub fn make_rw(&mut self) {
                unsafe {
                    mprotect(self.ptr.cast(), self.len, MprotectFlags::READ | MprotectFlags::WRITE)
                }
                .expect("failed to unpublish code block");
                self.rx = false;
            }

            pub fn invalidate_icache(&self) {}

            pub fn as_slice(&self) -> &[u8] {
                unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
            }

            pub fn as_mut_slice(&mut self) -> &mut [u8] {
                debug_assert!(!self.rx, "writing a published code block");
                unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
            }
        }

        impl Drop for CodeBlock {
            fn drop(&mut self) {
                unsafe {
                    let _ = munmap(self.ptr.cast(), self.len);
                }
            }
        }
    } else {
        pub(crate) struct CodeBlock {
            buf: Box<[u8]>,
            rx: bool,
        }

        impl CodeBlock {
            pub fn new(size: usize) -> Self {
                Self {
                    buf: vec![0; size].into_boxed_slice(),
                    rx: false,
                }
            }

            pub fn len(&self) -> usize {
                self.buf.len()
            }

            pub fn is_rx(&self) -> bool {
                self.rx
            }

            pub fn make_rx(&mut self) {
                self.rx = true;
            }

            pub fn make_rw(&mut self) {
                self.rx = false;
            }

            pub fn invalidate_icache(&self) {}

            pub fn as_slice(&self) -> &[u8] {
                &self.buf
            }

            pub fn as_mut_slice(&mut self) -> &mut [u8] {
                debug_assert!(!self.rx, "writing a published code block");
                &mut self.buf
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rw_then_rx_roundtrip() {
        let mut block = CodeBlock::new(100);
        assert!(block.len() >= 100);
        block.as_mut_slice()[0] = 0xAB;
        block.make_rx();
        assert!(block.is_rx());
        assert_eq!(block.as_slice()[0], 0xAB);
        block.make_rw();
        block.as_mut_slice()[1] = 0xCD;
        assert_eq!(block.as_slice()[..2], [0xAB, 0xCD]);
    }
}
