//! Device properties as handed over by the lifecycle framework.
//!
//! The framework passes a flat `(key, value)` bag. Integers are decimal or
//! `0x` hexadecimal; `size` additionally accepts binary size suffixes the
//! way QEMU's size properties do (`64K`, `16M`, `1G`, `2GiB`, ...).

use crate::error::{Error, Result};
use crate::registry::RegionKey;

/// Guest physical address of the primary window.
pub const ADDRESS_PROP: &str = "address";
/// Length of the region.
pub const SIZE_PROP: &str = "size";
/// Base name of the backing host object.
pub const NAME_PROP: &str = "name";
/// Guest physical address of the reserved window.
pub const COMM_ADDRESS_PROP: &str = "commAddress";
/// Length of the reserved window.
pub const RESERVED_SIZE_PROP: &str = "reservedSize";

/// Parsed device properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Backing object base name; the broker's default name when `None`.
    pub name: Option<String>,
    /// Guest physical address of the region.
    pub address: u64,
    /// Region length in bytes.
    pub size: u64,
    /// Guest address of the reserved window; the region address when `None`.
    pub comm_address: Option<u64>,
    /// Reserved window length in bytes.
    pub reserved_size: u64,
}

impl DeviceProperties {
    /// Properties for a region of `size` bytes at `address`.
    pub fn new(address: u64, size: u64) -> Self {
        Self {
            address,
            size,
            ..Self::default()
        }
    }

    /// Set the backing object name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the reserved window address.
    pub fn with_comm_address(mut self, comm_address: u64) -> Self {
        self.comm_address = Some(comm_address);
        self
    }

    /// Set the reserved window length.
    pub fn with_reserved_size(mut self, reserved_size: u64) -> Self {
        self.reserved_size = reserved_size;
        self
    }

    /// Parse a property bag.
    ///
    /// Accepted keys are [`ADDRESS_PROP`] (alias `addr`), [`SIZE_PROP`],
    /// [`NAME_PROP`], [`COMM_ADDRESS_PROP`] (alias `comm_addr`) and
    /// [`RESERVED_SIZE_PROP`] (alias `reserved_size`). Later keys override
    /// earlier ones.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidProperty`] for unknown keys or unparsable values.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut props = Self::default();

        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            let invalid = |reason: String| Error::InvalidProperty {
                key: key.to_string(),
                reason,
            };

            match key {
                ADDRESS_PROP | "addr" => props.address = parse_integer(value).map_err(invalid)?,
                SIZE_PROP => props.size = parse_size(value).map_err(invalid)?,
                NAME_PROP => props.name = Some(value.to_string()),
                COMM_ADDRESS_PROP | "comm_addr" => {
                    props.comm_address = Some(parse_integer(value).map_err(invalid)?)
                }
                RESERVED_SIZE_PROP | "reserved_size" => {
                    props.reserved_size = parse_size(value).map_err(invalid)?
                }
                _ => return Err(invalid("unknown property".into())),
            }
        }

        Ok(props)
    }

    /// Parse a comma separated `key=value` list, e.g.
    /// `address=0xf0000000,size=16M,name=SharedRAM_L`.
    pub fn parse(spec: &str) -> Result<Self> {
        let pairs = spec
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                item.split_once('=').ok_or_else(|| Error::InvalidProperty {
                    key: item.to_string(),
                    reason: "expected key=value".into(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_pairs(pairs)
    }

    /// Region identity these properties ask for.
    pub fn region_key(&self, default_name: &str) -> RegionKey {
        RegionKey::new(
            self.name.as_deref().unwrap_or(default_name),
            self.address,
            self.size,
            self.reserved_size,
        )
    }

    /// Reserved window address, given the region address as fallback.
    pub fn comm_address_or_base(&self) -> u64 {
        self.comm_address.unwrap_or(self.address)
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal integer.
pub fn parse_integer(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.map_err(|e| format!("`{value}` is not an integer: {e}"))
}

/// Parse a size with an optional binary suffix.
///
/// Suffixes `K`, `M`, `G`, `T`, `P`, `E` (any case) multiply by powers of
/// 1024 and may be followed by `B` or `iB`; a bare `B` means bytes.
/// Hexadecimal values take no suffix.
pub fn parse_size(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    if value.starts_with("0x") || value.starts_with("0X") {
        return parse_integer(value);
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    if digits.is_empty() {
        return Err(format!("`{value}` is not a size"));
    }
    let number = digits
        .parse::<u64>()
        .map_err(|e| format!("`{value}` is not a size: {e}"))?;

    let unit = suffix
        .strip_suffix("iB")
        .or_else(|| suffix.strip_suffix('B'))
        .unwrap_or(suffix);
    let shift = match unit {
        "" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        "p" | "P" => 50,
        "e" | "E" => 60,
        _ => return Err(format!("`{value}` has an unknown size suffix `{suffix}`")),
    };
    if unit.is_empty() && suffix == "iB" {
        return Err(format!("`{value}` has an unknown size suffix `{suffix}`"));
    }

    number
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("`{value}` is too large"))
}
