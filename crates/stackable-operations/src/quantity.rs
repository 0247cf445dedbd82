//! Parsing and comparison of Kubernetes quantities such as `5Gi` or `500m`.
//!
//! Volume sizes are reported back by storage providers in whatever unit they prefer, so a
//! requested `5G` may show up as a capacity of `5Gi`. Quantities therefore compare by their
//! numeric value in base units, never by their string representation.

use std::{cmp::Ordering, fmt::Display, num::ParseFloatError, str::FromStr};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use snafu::{ResultExt as _, Snafu, ensure};

#[derive(Debug, PartialEq, Snafu)]
pub enum ParseQuantityError {
    #[snafu(display("input is either empty or contains non-ascii characters"))]
    InvalidFormat,

    #[snafu(display("failed to parse floating point number"))]
    InvalidFloat { source: ParseFloatError },

    #[snafu(display("failed to parse {input:?} as quantity suffix"))]
    InvalidSuffix { input: String },
}

#[derive(Clone, Copy, Debug)]
pub struct Quantity {
    /// The numeric part, `<signedNumber>` in the Kubernetes serialization format.
    value: f64,

    suffix: Option<Suffix>,
}

impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        ensure!(!input.is_empty() && input.is_ascii(), InvalidFormatSnafu);

        let number_start = usize::from(input.starts_with(['+', '-']));
        let suffix_index = input[number_start..]
            .find(|c: char| c != '.' && !c.is_ascii_digit())
            .map(|index| index + number_start);

        let (number, suffix) = match suffix_index {
            Some(index) => input.split_at(index),
            None => (input, ""),
        };
        let value = f64::from_str(number).context(InvalidFloatSnafu)?;
        let suffix = match suffix {
            "" => None,
            suffix => Some(Suffix::from_str(suffix)?),
        };

        Ok(Self { value, suffix })
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.suffix {
            Some(suffix) => write!(f, "{value}{suffix}", value = self.value),
            None => write!(f, "{value}", value = self.value),
        }
    }
}

impl TryFrom<&K8sQuantity> for Quantity {
    type Error = ParseQuantityError;

    fn try_from(value: &K8sQuantity) -> Result<Self, Self::Error> {
        Self::from_str(&value.0)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.base_value() == other.base_value()
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.base_value().partial_cmp(&other.base_value())
    }
}

impl Quantity {
    /// The value without suffix, e.g. `1Ki` is `1024.0`.
    pub fn base_value(&self) -> f64 {
        match &self.suffix {
            Some(suffix) => self.value * suffix.factor(),
            None => self.value,
        }
    }
}

/// Compares two Kubernetes quantities by value.
pub fn compare(left: &K8sQuantity, right: &K8sQuantity) -> Result<Ordering, ParseQuantityError> {
    let left = Quantity::try_from(left)?;
    let right = Quantity::try_from(right)?;
    Ok(left.partial_cmp(&right).unwrap_or(Ordering::Equal))
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Suffix {
    BinaryMultiple(BinaryMultiple),
    DecimalMultiple(DecimalMultiple),
    DecimalExponent(f64),
}

impl FromStr for Suffix {
    type Err = ParseQuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if let Ok(binary) = BinaryMultiple::from_str(input) {
            return Ok(Self::BinaryMultiple(binary));
        }

        if let Ok(decimal) = DecimalMultiple::from_str(input) {
            return Ok(Self::DecimalMultiple(decimal));
        }

        if let Some(exponent) = input.strip_prefix(['e', 'E']) {
            if let Ok(exponent) = f64::from_str(exponent) {
                return Ok(Self::DecimalExponent(exponent));
            }
        }

        InvalidSuffixSnafu { input }.fail()
    }
}

impl Display for Suffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BinaryMultiple(binary) => write!(f, "{binary}"),
            Self::DecimalMultiple(decimal) => write!(f, "{decimal}"),
            Self::DecimalExponent(exponent) => write!(f, "e{exponent}"),
        }
    }
}

impl Suffix {
    pub fn factor(&self) -> f64 {
        match self {
            Self::BinaryMultiple(binary) => binary.factor(),
            Self::DecimalMultiple(decimal) => decimal.factor(),
            Self::DecimalExponent(exponent) => 10f64.powf(*exponent),
        }
    }
}

/// Byte multiples based on powers of 2, as defined in IEC 80000-13.
#[derive(Clone, Copy, Debug, PartialEq, strum::Display, strum::EnumString)]
pub enum BinaryMultiple {
    #[strum(serialize = "Ki")]
    Kibi,

    #[strum(serialize = "Mi")]
    Mebi,

    #[strum(serialize = "Gi")]
    Gibi,

    #[strum(serialize = "Ti")]
    Tebi,

    #[strum(serialize = "Pi")]
    Pebi,

    #[strum(serialize = "Ei")]
    Exbi,
}

impl BinaryMultiple {
    pub fn factor(&self) -> f64 {
        match self {
            Self::Kibi => 2f64.powi(10),
            Self::Mebi => 2f64.powi(20),
            Self::Gibi => 2f64.powi(30),
            Self::Tebi => 2f64.powi(40),
            Self::Pebi => 2f64.powi(50),
            Self::Exbi => 2f64.powi(60),
        }
    }
}

/// Multiples based on powers of 10. Note that Kubernetes uses `k` rather than `K` for kilo.
#[derive(Clone, Copy, Debug, PartialEq, strum::Display, strum::EnumString)]
pub enum DecimalMultiple {
    #[strum(serialize = "n")]
    Nano,

    #[strum(serialize = "u")]
    Micro,

    #[strum(serialize = "m")]
    Milli,

    #[strum(serialize = "k")]
    Kilo,

    #[strum(serialize = "M")]
    Mega,

    #[strum(serialize = "G")]
    Giga,

    #[strum(serialize = "T")]
    Tera,

    #[strum(serialize = "P")]
    Peta,

    #[strum(serialize = "E")]
    Exa,
}

impl DecimalMultiple {
    pub fn factor(&self) -> f64 {
        match self {
            Self::Nano => 10f64.powi(-9),
            Self::Micro => 10f64.powi(-6),
            Self::Milli => 10f64.powi(-3),
            Self::Kilo => 10f64.powi(3),
            Self::Mega => 10f64.powi(6),
            Self::Giga => 10f64.powi(9),
            Self::Tera => 10f64.powi(12),
            Self::Peta => 10f64.powi(15),
            Self::Exa => 10f64.powi(18),
        }
    }
}
