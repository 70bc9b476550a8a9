use crate::error::DecodeError;

/// Cursor over a response payload that reports truncation against the
/// command being decoded.
pub(crate) struct ByteReader<'a> {
    command: &'static str,
    bytes: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(command: &'static str, bytes: &'a [u8]) -> Self {
        Self { command, bytes }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() < n {
            return Err(DecodeError::Truncated {
                command: self.command,
                needed: n,
                available: self.bytes.len(),
            });
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32_le(&mut self) -> Result<u32, DecodeError> {
        self.array::<4>().map(u32::from_le_bytes)
    }

    pub fn u64_le(&mut self) -> Result<u64, DecodeError> {
        self.array::<8>().map(u64::from_le_bytes)
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }

    /// Consume and return everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.bytes)
    }

    /// Fail if any bytes are left unread.
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.bytes.len() {
            0 => Ok(()),
            trailing => Err(DecodeError::TrailingBytes {
                command: self.command,
                trailing,
            }),
        }
    }
}
