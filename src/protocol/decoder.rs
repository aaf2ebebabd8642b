use std::{convert::Infallible, num::TryFromIntError, str::Utf8Error};

/// An error while decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("need at least {0} more bytes")]
    EndOfStream(usize),
    #[error("invalid boolean pattern {0} - expected either 0 or 1")]
    InvalidBool(u8),
    #[error("varint / varlong is too long")]
    VarIntTooLong,
    #[error("string exceeds max allowed length")]
    StringTooLong,
    #[error("sub-packet length {length} exceeds the {remaining} remaining bytes")]
    TruncatedFrame { length: usize, remaining: usize },
    #[error("unknown discriminant {0} for {1}")]
    UnknownDiscriminant(i64, &'static str),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    IntConversion(#[from] TryFromIntError),
    /// Cannot occur; keeps integer conversions uniform.
    #[error(transparent)]
    Infallible(#[from] Infallible),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

const MAX_STRING_LENGTH: usize = i16::MAX as usize;

/// A raw decoder for a Bedrock bitstream. Little-endian, LEB128 varints,
/// zigzag signed varints; mirror of [`crate::protocol::encoder::Encoder`].
#[derive(Debug)]
pub struct Decoder<'a> {
    buffer: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder from the buffer it will read from.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    /// Gets the remaining buffer.
    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    /// Returns if there is no data left in the buffer.
    pub fn is_finished(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consumes `n` bytes from the buffer, returning them as a slice.
    pub fn consume_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if n <= self.buffer.len() {
            let (data, buffer) = self.buffer.split_at(n);
            self.buffer = buffer;
            Ok(data)
        } else {
            Err(DecodeError::EndOfStream(n - self.buffer.len()))
        }
    }

    /// Consumes the rest of the buffer.
    pub fn consume_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buffer)
    }

    /// Consumes `N` bytes into an array.
    pub fn consume<const N: usize>(&mut self) -> Result<[u8; N]> {
        let data = self.consume_slice(N)?;
        Ok(<[u8; N]>::try_from(data).unwrap())
    }

    /// Reads an unsigned byte from the stream.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.consume::<1>().map(|[x]| x)
    }

    /// Reads a signed byte from the stream.
    pub fn read_i8(&mut self) -> Result<i8> {
        self.consume().map(i8::from_le_bytes)
    }

    /// Reads an unsigned short from the stream.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.consume().map(u16::from_le_bytes)
    }

    /// Reads an unsigned int from the stream.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.consume().map(u32::from_le_bytes)
    }

    /// Reads a signed int from the stream.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.consume().map(i32::from_le_bytes)
    }

    /// Reads a big-endian signed int from the stream.
    pub fn read_i32_be(&mut self) -> Result<i32> {
        self.consume().map(i32::from_be_bytes)
    }

    /// Reads an unsigned long from the stream.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.consume().map(u64::from_le_bytes)
    }

    /// Reads a float from the stream.
    pub fn read_f32(&mut self) -> Result<f32> {
        self.consume().map(f32::from_le_bytes)
    }

    /// Reads a boolean from the stream.
    pub fn read_bool(&mut self) -> Result<bool> {
        let x = self.read_u8()?;
        match x {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidBool(x)),
        }
    }

    /// Reads an unsigned VarInt from the stream.
    pub fn read_var_u32(&mut self) -> Result<u32> {
        let mut num_read = 0;
        let mut result: u32 = 0;

        loop {
            let read = self.read_u8()?;
            let value = u32::from(read & 0b0111_1111);
            result |= value.overflowing_shl(7 * num_read).0;

            num_read += 1;

            if num_read > 5 {
                return Err(DecodeError::VarIntTooLong);
            }
            if read & 0b1000_0000 == 0 {
                break;
            }
        }
        Ok(result)
    }

    /// Reads an unsigned VarLong from the stream.
    pub fn read_var_u64(&mut self) -> Result<u64> {
        let mut num_read = 0;
        let mut result: u64 = 0;

        loop {
            let read = self.read_u8()?;
            let value = u64::from(read & 0b0111_1111);
            result |= value.overflowing_shl(7 * num_read).0;

            num_read += 1;

            if num_read > 10 {
                return Err(DecodeError::VarIntTooLong);
            }
            if read & 0b1000_0000 == 0 {
                break;
            }
        }
        Ok(result)
    }

    /// Reads a zigzag-encoded signed VarInt from the stream.
    pub fn read_var_i32(&mut self) -> Result<i32> {
        let zigzag = self.read_var_u32()?;
        Ok(((zigzag >> 1) as i32) ^ -((zigzag & 1) as i32))
    }

    /// Reads a zigzag-encoded signed VarLong from the stream.
    pub fn read_var_i64(&mut self) -> Result<i64> {
        let zigzag = self.read_var_u64()?;
        Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
    }

    /// Reads a VarInt-prefixed string from the stream.
    pub fn read_string(&mut self) -> Result<&'a str> {
        let length = usize::try_from(self.read_var_u32()?)?;

        if length > MAX_STRING_LENGTH {
            return Err(DecodeError::StringTooLong);
        }

        let bytes = std::str::from_utf8(self.consume_slice(length)?)?;
        Ok(bytes)
    }

    /// Reads a string prefixed by a little-endian u32 length.
    pub fn read_u32_string(&mut self) -> Result<&'a str> {
        let length = usize::try_from(self.read_u32()?)?;
        let bytes = std::str::from_utf8(self.consume_slice(length)?)?;
        Ok(bytes)
    }

    /// Reads a VarInt-prefixed byte array from the stream.
    pub fn read_byte_array(&mut self) -> Result<&'a [u8]> {
        let length = usize::try_from(self.read_var_u32()?)?;
        self.consume_slice(length)
    }
}

/// A type that can be read from a [`Decoder`].
pub trait Decode: Sized {
    fn decode(decoder: &mut Decoder) -> Result<Self>;
}
