//! Fixed code tables of the SensorLab wire format
//!
//! Data types, SI magnitude prefixes and SI units are each carried as a single
//! byte. The tables are closed: a code outside them is a decode error.

use crate::types::{CodeTable, DecodeError};
use serde::{Serialize, Serializer};
use std::fmt;

/// Property value data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Bool = 0x00,
    I8 = 0x01,
    I16 = 0x02,
    I32 = 0x03,
    I64 = 0x04,
    U8 = 0x05,
    U16 = 0x06,
    U32 = 0x07,
    U64 = 0x08,
    F32 = 0x09,
    F64 = 0x0A,
    AsciiArray = 0x0B,
    ByteArray = 0x0C,
    Invalid = 0x0D,
    F32Array = 0x0E,
    F64Array = 0x0F,
}

impl DataType {
    /// Width in bytes of a fixed-width type, `None` for the array and raw types
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::I8 | DataType::U8 => Some(1),
            DataType::I16 | DataType::U16 => Some(2),
            DataType::I32 | DataType::U32 | DataType::F32 => Some(4),
            DataType::I64 | DataType::U64 | DataType::F64 => Some(8),
            DataType::AsciiArray
            | DataType::ByteArray
            | DataType::Invalid
            | DataType::F32Array
            | DataType::F64Array => None,
        }
    }

    /// Human readable title used in structured output
    pub fn title(self) -> &'static str {
        match self {
            DataType::Bool => "boolean",
            DataType::I8 => "int8",
            DataType::I16 => "int16",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::F32 => "float",
            DataType::F64 => "double",
            DataType::AsciiArray => "asciiArray",
            DataType::ByteArray => "byteArray",
            DataType::Invalid => "invalid",
            DataType::F32Array => "floatArray",
            DataType::F64Array => "doubleArray",
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x00 => DataType::Bool,
            0x01 => DataType::I8,
            0x02 => DataType::I16,
            0x03 => DataType::I32,
            0x04 => DataType::I64,
            0x05 => DataType::U8,
            0x06 => DataType::U16,
            0x07 => DataType::U32,
            0x08 => DataType::U64,
            0x09 => DataType::F32,
            0x0A => DataType::F64,
            0x0B => DataType::AsciiArray,
            0x0C => DataType::ByteArray,
            0x0D => DataType::Invalid,
            0x0E => DataType::F32Array,
            0x0F => DataType::F64Array,
            _ => {
                return Err(DecodeError::UnknownCode {
                    table: CodeTable::DataType,
                    code,
                })
            }
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// SI magnitude prefixes, from yotta (0x00) down to yocto (0x14)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum UnitPrefix {
    Yotta = 0x00,
    Zetta = 0x01,
    Exa = 0x02,
    Peta = 0x03,
    Tera = 0x04,
    Giga = 0x05,
    Mega = 0x06,
    Kilo = 0x07,
    Hecto = 0x08,
    Deca = 0x09,
    #[default]
    None = 0x0A,
    Deci = 0x0B,
    Centi = 0x0C,
    Milli = 0x0D,
    Micro = 0x0E,
    Nano = 0x0F,
    Pico = 0x10,
    Femto = 0x11,
    Atto = 0x12,
    Zepto = 0x13,
    Yocto = 0x14,
}

const PREFIXES: [UnitPrefix; 21] = [
    UnitPrefix::Yotta,
    UnitPrefix::Zetta,
    UnitPrefix::Exa,
    UnitPrefix::Peta,
    UnitPrefix::Tera,
    UnitPrefix::Giga,
    UnitPrefix::Mega,
    UnitPrefix::Kilo,
    UnitPrefix::Hecto,
    UnitPrefix::Deca,
    UnitPrefix::None,
    UnitPrefix::Deci,
    UnitPrefix::Centi,
    UnitPrefix::Milli,
    UnitPrefix::Micro,
    UnitPrefix::Nano,
    UnitPrefix::Pico,
    UnitPrefix::Femto,
    UnitPrefix::Atto,
    UnitPrefix::Zepto,
    UnitPrefix::Yocto,
];

impl UnitPrefix {
    pub fn symbol(self) -> &'static str {
        match self {
            UnitPrefix::Yotta => "Y",
            UnitPrefix::Zetta => "Z",
            UnitPrefix::Exa => "E",
            UnitPrefix::Peta => "P",
            UnitPrefix::Tera => "T",
            UnitPrefix::Giga => "G",
            UnitPrefix::Mega => "M",
            UnitPrefix::Kilo => "k",
            UnitPrefix::Hecto => "h",
            UnitPrefix::Deca => "da",
            UnitPrefix::None => "",
            UnitPrefix::Deci => "d",
            UnitPrefix::Centi => "c",
            UnitPrefix::Milli => "m",
            UnitPrefix::Micro => "u",
            UnitPrefix::Nano => "n",
            UnitPrefix::Pico => "p",
            UnitPrefix::Femto => "f",
            UnitPrefix::Atto => "a",
            UnitPrefix::Zepto => "z",
            UnitPrefix::Yocto => "y",
        }
    }
}

impl TryFrom<u8> for UnitPrefix {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        PREFIXES
            .get(code as usize)
            .copied()
            .ok_or(DecodeError::UnknownCode {
                table: CodeTable::Prefix,
                code,
            })
    }
}

impl Serialize for UnitPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

/// SI units plus the few logarithmic units the nodes report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Unit {
    #[default]
    None = 0x00,
    Meter = 0x01,
    Kilogram = 0x02,
    Second = 0x03,
    Ampere = 0x04,
    Kelvin = 0x05,
    Mole = 0x06,
    Candela = 0x07,
    Radian = 0x08,
    Steradian = 0x09,
    Hertz = 0x0A,
    Newton = 0x0B,
    Pascal = 0x0C,
    Joule = 0x0D,
    Watt = 0x0E,
    Coulomb = 0x0F,
    Volt = 0x10,
    Farad = 0x11,
    Ohm = 0x12,
    Siemens = 0x13,
    Weber = 0x14,
    Tesla = 0x15,
    Henry = 0x16,
    Celsius = 0x17,
    Lumen = 0x18,
    Lux = 0x19,
    Becquerel = 0x1A,
    Gray = 0x1B,
    Sievert = 0x1C,
    Katal = 0x1D,
    Decibel = 0x1E,
    DecibelWatt = 0x1F,
    DecibelMilliwatt = 0x20,
}

const UNITS: [Unit; 33] = [
    Unit::None,
    Unit::Meter,
    Unit::Kilogram,
    Unit::Second,
    Unit::Ampere,
    Unit::Kelvin,
    Unit::Mole,
    Unit::Candela,
    Unit::Radian,
    Unit::Steradian,
    Unit::Hertz,
    Unit::Newton,
    Unit::Pascal,
    Unit::Joule,
    Unit::Watt,
    Unit::Coulomb,
    Unit::Volt,
    Unit::Farad,
    Unit::Ohm,
    Unit::Siemens,
    Unit::Weber,
    Unit::Tesla,
    Unit::Henry,
    Unit::Celsius,
    Unit::Lumen,
    Unit::Lux,
    Unit::Becquerel,
    Unit::Gray,
    Unit::Sievert,
    Unit::Katal,
    Unit::Decibel,
    Unit::DecibelWatt,
    Unit::DecibelMilliwatt,
];

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::Meter => "m",
            Unit::Kilogram => "kg",
            Unit::Second => "s",
            Unit::Ampere => "A",
            Unit::Kelvin => "K",
            Unit::Mole => "M",
            Unit::Candela => "Cd",
            Unit::Radian => "rad",
            Unit::Steradian => "sr",
            Unit::Hertz => "Hz",
            Unit::Newton => "N",
            Unit::Pascal => "Pa",
            Unit::Joule => "J",
            Unit::Watt => "W",
            Unit::Coulomb => "C",
            Unit::Volt => "V",
            Unit::Farad => "F",
            Unit::Ohm => "Ohm",
            Unit::Siemens => "S",
            Unit::Weber => "Wb",
            Unit::Tesla => "T",
            Unit::Henry => "H",
            // Coulomb and degree Celsius share a symbol on the wire tables
            Unit::Celsius => "C",
            Unit::Lumen => "lm",
            Unit::Lux => "lx",
            Unit::Becquerel => "Bq",
            Unit::Gray => "Gy",
            Unit::Sievert => "Sv",
            Unit::Katal => "kat",
            Unit::Decibel => "dB",
            Unit::DecibelWatt => "dBW",
            Unit::DecibelMilliwatt => "dBm",
        }
    }
}

impl TryFrom<u8> for Unit {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        UNITS.get(code as usize).copied().ok_or(DecodeError::UnknownCode {
            table: CodeTable::Unit,
            code,
        })
    }
}

impl Serialize for Unit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_indexed_by_code() {
        for (code, prefix) in PREFIXES.iter().enumerate() {
            assert_eq!(*prefix as u8 as usize, code);
        }
        for (code, unit) in UNITS.iter().enumerate() {
            assert_eq!(*unit as u8 as usize, code);
        }
    }

    #[test]
    fn test_prefix_lookup() {
        assert_eq!(UnitPrefix::try_from(0x0A).unwrap(), UnitPrefix::None);
        assert_eq!(UnitPrefix::try_from(0x0D).unwrap().symbol(), "m");
        assert_eq!(UnitPrefix::try_from(0x09).unwrap().symbol(), "da");
        assert!(UnitPrefix::try_from(0x15).is_err());
    }

    #[test]
    fn test_unit_lookup() {
        assert_eq!(Unit::try_from(0x10).unwrap(), Unit::Volt);
        assert_eq!(Unit::try_from(0x20).unwrap().symbol(), "dBm");
        assert!(matches!(
            Unit::try_from(0x21),
            Err(DecodeError::UnknownCode { table: CodeTable::Unit, code: 0x21 })
        ));
    }

    #[test]
    fn test_data_type_widths() {
        assert_eq!(DataType::try_from(0x04).unwrap().fixed_width(), Some(8));
        assert_eq!(DataType::Bool.fixed_width(), Some(1));
        assert_eq!(DataType::F32Array.fixed_width(), None);
        assert!(DataType::try_from(0x10).is_err());
    }
}
