//! Fixed-capacity text rendering helpers

use core::fmt;

/// A `fmt::Write` sink that renders into a `heapless::String` and keeps
/// counting once the capacity is exhausted.
///
/// The total is what callers compare against their configured bound, so an
/// overflow is always reported with the length the text actually needed
/// instead of being silently truncated.
pub struct BoundedWriter<const N: usize> {
    buf: heapless::String<N>,
    needed: usize,
}

impl<const N: usize> BoundedWriter<N> {
    pub const fn new() -> Self {
        Self {
            buf: heapless::String::new(),
            needed: 0,
        }
    }

    /// Number of bytes the rendered text required.
    pub const fn needed(&self) -> usize {
        self.needed
    }

    /// Whether everything that was written fit into the buffer.
    pub fn fits(&self) -> bool {
        self.needed == self.buf.len()
    }

    /// The rendered text if it fit, `Err(needed)` otherwise.
    pub fn finish(self) -> Result<heapless::String<N>, usize> {
        if self.fits() {
            Ok(self.buf)
        } else {
            Err(self.needed)
        }
    }

    /// The rendered text, cut at the capacity if it overflowed.
    pub fn into_lossy(self) -> heapless::String<N> {
        self.buf
    }
}

impl<const N: usize> Default for BoundedWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for BoundedWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.needed += s.len();
        if self.needed == self.buf.len() + s.len() {
            // Still exact so far; a failed push leaves the buffer untouched.
            if self.buf.push_str(s).is_err() {
                // Keep whole characters only
                for c in s.chars() {
                    if self.buf.push(c).is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Render `args` into a fixed-capacity string, failing with the needed
/// length when it does not fit.
pub fn render<const N: usize>(args: fmt::Arguments<'_>) -> Result<heapless::String<N>, usize> {
    let mut writer = BoundedWriter::<N>::new();
    // BoundedWriter never returns an error itself
    let _ = fmt::write(&mut writer, args);
    writer.finish()
}
