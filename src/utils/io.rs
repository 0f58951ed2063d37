//! Little-endian reading and writing of fixed-width integers in byte buffers.
//!
//! Every structure this crate places into guest memory is a little-endian 32-bit Windows
//! structure. Records are assembled in a local buffer with [`write_le_at`] and decoded with
//! [`read_le_at`] before a single transfer to or from guest memory.
//!
//! # Examples
//!
//! ```rust,ignore
//! use crate::utils::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 0x0102_u16)?;
//! write_le_at(&mut data, &mut offset, 0xDEAD_BEEF_u32)?;
//!
//! let mut offset = 2;
//! let value: u32 = read_le_at(&data, &mut offset)?;
//! assert_eq!(value, 0xDEAD_BEEF);
//! ```

use crate::{Error::OutOfBounds, Result};

/// Trait for the integer widths used by guest structures.
///
/// Each implementation defines a `Bytes` associated type that represents the fixed-size byte
/// array required for that particular type (e.g., `[u8; 4]` for `u32`).
pub trait GuestIO: Sized {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

impl GuestIO for u32 {
    type Bytes = [u8; 4];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        u32::from_le_bytes(bytes)
    }

    fn to_le_bytes(self) -> Self::Bytes {
        u32::to_le_bytes(self)
    }
}

impl GuestIO for u16 {
    type Bytes = [u8; 2];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        u16::from_le_bytes(bytes)
    }

    fn to_le_bytes(self) -> Self::Bytes {
        u16::to_le_bytes(self)
    }
}

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: GuestIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at a specific offset.
///
/// The offset is advanced by the number of bytes read.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: GuestIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    if (type_len + *offset) > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..*offset + type_len].try_into() else {
        return Err(OutOfBounds);
    };

    *offset += type_len;

    Ok(T::from_le_bytes(read))
}

/// Safely writes a value of type `T` in little-endian byte order at a specific offset.
///
/// The offset is advanced by the number of bytes written.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn write_le_at<T: GuestIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    if (type_len + *offset) > data.len() {
        return Err(OutOfBounds);
    }

    let bytes = value.to_le_bytes();
    data[*offset..*offset + type_len].copy_from_slice(bytes.as_ref());
    *offset += type_len;

    Ok(())
}

/// Writes a value at a fixed offset without tracking a cursor.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn write_le_field<T: GuestIO>(data: &mut [u8], offset: usize, value: T) -> Result<()> {
    let mut offset = offset;
    write_le_at(data, &mut offset, value)
}

/// Reads a value at a fixed offset without tracking a cursor.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_field<T: GuestIO>(data: &[u8], offset: usize) -> Result<T> {
    let mut offset = offset;
    read_le_at(data, &mut offset)
}
