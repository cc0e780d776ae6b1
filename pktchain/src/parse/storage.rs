use crate::{Error, Result};

/// Backing bytes of one interpreter, as seen by the field parsers.
///
/// Offsets are absolute positions into [`Storage::data`]. Size-changing
/// operations go through [`Storage::insert_zeroed`] and [`Storage::erase`]
/// so that the owner can keep every other view on the same bytes in sync.
pub trait Storage {
    fn data(&self) -> &[u8];

    fn data_mut(&mut self) -> &mut [u8];

    /// Offset of the first byte of the interpreter owning the layout.
    fn begin(&self) -> usize;

    /// End of the bytes available to the layout. Rest-of-range vectors
    /// extend up to here.
    fn limit(&self) -> usize;

    /// Insert `len` zero bytes at `pos` on behalf of the interpreter.
    fn insert_zeroed(&mut self, pos: usize, len: usize) -> Result<()>;

    fn erase(&mut self, pos: usize, len: usize) -> Result<()>;
}

/// A sub-range of another [`Storage`], e.g. one element of a list.
///
/// The window grows and shrinks with the bytes inserted into or erased from
/// it. Modifications outside of it are rejected.
pub struct Window<'a> {
    inner: &'a mut dyn Storage,
    begin: usize,
    end: usize,
}

impl<'a> Window<'a> {
    pub fn new(inner: &'a mut dyn Storage, begin: usize, end: usize) -> Self {
        Self { inner, begin, end }
    }

    fn check(&self, pos: usize, len: usize) -> Result<()> {
        if pos < self.begin || pos.saturating_add(len) > self.end {
            return Err(Error::InvalidChain("modification outside of the window"));
        }
        Ok(())
    }
}

impl Storage for Window<'_> {
    fn data(&self) -> &[u8] {
        self.inner.data()
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.inner.data_mut()
    }

    fn begin(&self) -> usize {
        self.begin
    }

    fn limit(&self) -> usize {
        self.end
    }

    fn insert_zeroed(&mut self, pos: usize, len: usize) -> Result<()> {
        self.check(pos, 0)?;
        self.inner.insert_zeroed(pos, len)?;
        self.end += len;
        Ok(())
    }

    fn erase(&mut self, pos: usize, len: usize) -> Result<()> {
        self.check(pos, len)?;
        self.inner.erase(pos, len)?;
        self.end -= len;
        Ok(())
    }
}

/// A plain buffer interpreted from its first byte to its last.
impl Storage for Vec<u8> {
    fn data(&self) -> &[u8] {
        self
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self
    }

    fn begin(&self) -> usize {
        0
    }

    fn limit(&self) -> usize {
        self.len()
    }

    fn insert_zeroed(&mut self, pos: usize, len: usize) -> Result<()> {
        if pos > self.len() {
            return Err(Error::truncated("buffer", pos, self.len()));
        }
        self.splice(pos..pos, core::iter::repeat(0).take(len));
        Ok(())
    }

    fn erase(&mut self, pos: usize, len: usize) -> Result<()> {
        if pos + len > self.len() {
            return Err(Error::truncated("buffer", pos + len, self.len()));
        }
        self.drain(pos..pos + len);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_window_follows_resizes() {
        let mut buf = vec![1, 2, 3, 4, 5];
        let mut window = Window::new(&mut buf, 1, 3);
        assert_eq!((window.begin(), window.limit()), (1, 3));
        window.insert_zeroed(3, 2).unwrap();
        assert_eq!(window.limit(), 5);
        window.erase(1, 1).unwrap();
        assert_eq!(window.limit(), 4);
        assert!(window.insert_zeroed(0, 1).is_err());
        assert!(window.erase(3, 2).is_err());
        assert_eq!(buf, [1, 3, 0, 0, 4, 5]);
    }
}
