//! Generic decode/encode for status words.
//!
//! Vendor status and mode registers are declared with `bitflags!`, whose
//! named constants are the one table of field name to bit. The routines here
//! are the only code that converts between those types and their wire form,
//! so decode and encode cannot disagree about a bit position.
//!
//! Unknown bits are retained on decode, which makes `encode(decode(x)) == x`
//! for every 16-bit `x`.

use crate::error::{DeviceError, DeviceResult};
use bitflags::Flags;

/// Decode a hexadecimal register value. Accepts an optional `0x` prefix and
/// surrounding whitespace.
pub fn decode_hex<F>(text: &str) -> DeviceResult<F>
where
    F: Flags<Bits = u16>,
{
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16)
        .map(F::from_bits_retain)
        .map_err(|_| DeviceError::decode("hexadecimal register", text))
}

/// Encode as lower-case hexadecimal without prefix or padding.
pub fn encode_hex<F>(flags: &F) -> String
where
    F: Flags<Bits = u16>,
{
    format!("{:x}", flags.bits())
}

/// Every named field with its current state, in table order.
pub fn fields<F>(flags: &F) -> Vec<(&'static str, bool)>
where
    F: Flags + Copy,
{
    F::FLAGS
        .iter()
        .map(|flag| (flag.name(), flags.contains(*flag.value())))
        .collect()
}

/// Set or clear a field by its table name.
pub fn set_field<F>(flags: &mut F, name: &str, value: bool) -> DeviceResult<()>
where
    F: Flags + Copy,
{
    let field = F::from_name(name)
        .ok_or_else(|| DeviceError::InvalidParameter(format!("unknown field '{}'", name)))?;
    flags.set(field, value);
    Ok(())
}

/// Names of the fields that are set.
pub fn active_fields<F>(flags: &F) -> Vec<&'static str>
where
    F: Flags + Copy,
{
    fields(flags)
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect()
}
