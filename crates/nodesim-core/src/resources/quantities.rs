use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Nano-units per whole unit
const NANOS_PER_UNIT: i128 = 1_000_000_000;

/// Largest power of ten that fits an i128
const MAX_POW10: u32 = 38;

/// Decimal SI suffixes and their base-10 exponent, largest first
const DECIMAL_SUFFIXES: [(&str, i32); 10] = [
    ("E", 18),
    ("P", 15),
    ("T", 12),
    ("G", 9),
    ("M", 6),
    ("k", 3),
    ("", 0),
    ("m", -3),
    ("u", -6),
    ("n", -9),
];

/// Binary SI suffixes and their power of 1024, largest first
const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ei", 6),
    ("Pi", 5),
    ("Ti", 4),
    ("Gi", 3),
    ("Mi", 2),
    ("Ki", 1),
];

/// How a quantity was written, and therefore how it is printed back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantityFormat {
    /// `Ki`, `Mi`, `Gi`, ...
    BinarySI,
    /// `m`, `k`, `M`, ... or no suffix
    #[default]
    DecimalSI,
    /// `1e3`, `5E-3`, ...
    DecimalExponent,
}

/// Errors produced while parsing or combining quantities
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuantityError {
    #[error("quantity is empty")]
    Empty,

    #[error("quantity '{0}' does not match the quantity grammar")]
    InvalidFormat(String),

    #[error("quantity '{0}' has an unknown suffix")]
    InvalidSuffix(String),

    #[error("quantity '{0}' is out of range")]
    Overflow(String),
}

/// An exact resource quantity (CPU, memory, pod slots, accelerator units).
///
/// Values are fixed-point integers counted in nano-units, so `500m` CPU is
/// `500_000_000` and `1Ki` is `1024 * 10^9`. Equality and ordering compare the
/// value only; the format is a printing hint carried from the parsed input.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceQuantity {
    nanos: i128,
    format: QuantityFormat,
}

impl ResourceQuantity {
    /// The zero quantity
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build a quantity from whole units (bytes, cores, pods, ...)
    pub fn from_units(units: i64, format: QuantityFormat) -> Self {
        Self {
            nanos: i128::from(units) * NANOS_PER_UNIT,
            format,
        }
    }

    /// Build a quantity from nano-units
    pub fn from_nanos(nanos: i128, format: QuantityFormat) -> Self {
        Self { nanos, format }
    }

    /// Value in nano-units
    pub fn nanos(&self) -> i128 {
        self.nanos
    }

    /// Value in milli-units, rounded up
    pub fn millis(&self) -> i128 {
        div_ceil(self.nanos, 1_000_000)
    }

    /// Value in whole units, rounded up, if it fits an i64
    pub fn to_i64(&self) -> Option<i64> {
        i64::try_from(div_ceil(self.nanos, NANOS_PER_UNIT)).ok()
    }

    pub fn format(&self) -> QuantityFormat {
        self.format
    }

    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    pub fn is_negative(&self) -> bool {
        self.nanos < 0
    }

    /// Parse a quantity in Kubernetes syntax (`4`, `500m`, `8Gi`, `1.5e3`)
    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, rest) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, suffix) = rest.split_at(number_end);

        let (whole, fraction) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return Err(QuantityError::InvalidFormat(input.to_string()));
        }

        let (exponent, binary_power, format) = parse_suffix(suffix)
            .ok_or_else(|| QuantityError::InvalidSuffix(input.to_string()))?;

        let overflow = || QuantityError::Overflow(input.to_string());

        let mut mantissa: i128 = 0;
        for digit in whole.bytes().chain(fraction.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(digit - b'0')))
                .ok_or_else(overflow)?;
        }

        let multiplier = 1024i128.checked_pow(binary_power).ok_or_else(overflow)?;
        let scaled = mantissa.checked_mul(multiplier).ok_or_else(overflow)?;

        // nanos = scaled * 10^(9 + exponent - fraction digits)
        let fraction_len = i32::try_from(fraction.len()).map_err(|_| overflow())?;
        let shift = 9 + exponent - fraction_len;
        let magnitude = if shift >= 0 {
            let factor = pow10(shift.unsigned_abs()).ok_or_else(overflow)?;
            scaled.checked_mul(factor).ok_or_else(overflow)?
        } else {
            // Anything finer than a nano-unit rounds up
            match pow10(shift.unsigned_abs()) {
                Some(divisor) => div_ceil(scaled, divisor),
                None => i128::from(scaled != 0),
            }
        };

        Ok(Self {
            nanos: if negative { -magnitude } else { magnitude },
            format,
        })
    }

    /// Exact sum, keeping this quantity's format
    pub fn checked_add(&self, other: &Self) -> Result<Self, QuantityError> {
        self.nanos
            .checked_add(other.nanos)
            .map(|nanos| Self {
                nanos,
                format: self.format,
            })
            .ok_or_else(|| QuantityError::Overflow(format!("{} + {}", self, other)))
    }

    /// Exact difference (may go negative), keeping this quantity's format
    pub fn checked_sub(&self, other: &Self) -> Result<Self, QuantityError> {
        self.nanos
            .checked_sub(other.nanos)
            .map(|nanos| Self {
                nanos,
                format: self.format,
            })
            .ok_or_else(|| QuantityError::Overflow(format!("{} - {}", self, other)))
    }

    /// Convert to the k8s-openapi wire representation
    pub fn to_quantity(&self) -> Quantity {
        Quantity(self.to_string())
    }
}

/// Split a suffix into (decimal exponent, binary power, format)
fn parse_suffix(suffix: &str) -> Option<(i32, u32, QuantityFormat)> {
    if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some((0, *power, QuantityFormat::BinarySI));
    }
    if let Some((_, exponent)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some((*exponent, 0, QuantityFormat::DecimalSI));
    }

    let digits = suffix.strip_prefix(['e', 'E'])?;
    let unsigned = digits.strip_prefix(['+', '-']).unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let exponent: i32 = digits.parse().ok()?;
    if exponent.unsigned_abs() > 2 * MAX_POW10 {
        return None;
    }
    Some((exponent, 0, QuantityFormat::DecimalExponent))
}

fn pow10(exponent: u32) -> Option<i128> {
    if exponent > MAX_POW10 {
        return None;
    }
    10i128.checked_pow(exponent)
}

/// Integer division rounding away from zero
fn div_ceil(value: i128, divisor: i128) -> i128 {
    let quotient = value / divisor;
    if value % divisor == 0 {
        quotient
    } else if value > 0 {
        quotient + 1
    } else {
        quotient - 1
    }
}

impl fmt::Display for ResourceQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos == 0 {
            return f.write_str("0");
        }
        if self.nanos < 0 {
            f.write_str("-")?;
        }
        let magnitude = self.nanos.unsigned_abs();
        let nanos_per_unit = NANOS_PER_UNIT as u128;

        if self.format == QuantityFormat::BinarySI && magnitude % nanos_per_unit == 0 {
            let units = magnitude / nanos_per_unit;
            for (suffix, power) in BINARY_SUFFIXES {
                let base = 1024u128.pow(power);
                if units % base == 0 {
                    return write!(f, "{}{}", units / base, suffix);
                }
            }
        }

        for (suffix, exponent) in DECIMAL_SUFFIXES {
            let divisor = 10u128.pow((exponent + 9).unsigned_abs());
            if magnitude % divisor != 0 {
                continue;
            }
            let mantissa = magnitude / divisor;
            return match (self.format, exponent) {
                (QuantityFormat::DecimalExponent, 0) => write!(f, "{}", mantissa),
                (QuantityFormat::DecimalExponent, e) => write!(f, "{}e{}", mantissa, e),
                _ => write!(f, "{}{}", mantissa, suffix),
            };
        }

        // Nano-units always divide evenly, so the loop above returns
        write!(f, "{}n", magnitude)
    }
}

impl FromStr for ResourceQuantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&Quantity> for ResourceQuantity {
    type Error = QuantityError;

    fn try_from(quantity: &Quantity) -> Result<Self, Self::Error> {
        Self::parse(&quantity.0)
    }
}

impl PartialEq for ResourceQuantity {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl Eq for ResourceQuantity {}

impl PartialOrd for ResourceQuantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceQuantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nanos.cmp(&other.nanos)
    }
}
