//! Photometric bands
//!
//! Per-band quantities are stored in [PerBand], a fixed size array indexed by [Band].
//! Which bands take part in a measurement is given separately as a slice of [Band]s.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    ops::{Index, IndexMut},
    str::FromStr,
};
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{AsRefStr, Display, EnumCount, EnumIter, EnumString};

/// Photometric band
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    EnumCount,
    EnumString,
    Display,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    U,
    G,
    R,
    I,
    Z,
    Y,
}
impl Band {
    pub const ALL: [Band; Band::COUNT] = [Band::U, Band::G, Band::R, Band::I, Band::Z, Band::Y];
    /// Index of the band in a [PerBand] array
    pub fn index(self) -> usize {
        self as usize
    }
    /// Name of the flux column of the band, e.g. `flux_i`
    pub fn flux_column(self) -> String {
        format!("flux_{}", self)
    }
    /// Name of the peak to noise ratio column of the band, e.g. `i peak/noise`
    pub fn ratio_column(self) -> String {
        format!("{} peak/noise", self)
    }
}

/// Parses a comma separated list of bands, e.g. `g,r,i`
pub fn parse_bands(bands: &str) -> Result<Vec<Band>, strum::ParseError> {
    bands
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(Band::from_str)
        .collect()
}

/// A value for every [Band]
#[derive(Debug, Clone, PartialEq)]
pub struct PerBand<T>([T; Band::COUNT]);
impl<T: Default> Default for PerBand<T> {
    fn default() -> Self {
        Self(std::array::from_fn(|_| T::default()))
    }
}
impl<T: Clone> PerBand<T> {
    /// Same value for all bands
    pub fn splat(value: T) -> Self {
        Self(std::array::from_fn(|_| value.clone()))
    }
}
impl<T> PerBand<T> {
    pub fn from_fn<F: FnMut(Band) -> T>(mut f: F) -> Self {
        Self(std::array::from_fn(|i| f(Band::ALL[i])))
    }
    pub fn iter(&self) -> impl Iterator<Item = (Band, &T)> {
        Band::iter().zip(self.0.iter())
    }
    pub fn map<U, F: FnMut(&T) -> U>(&self, mut f: F) -> PerBand<U> {
        PerBand::from_fn(|band| f(&self[band]))
    }
    /// Values of the given bands, in the order of `bands`
    pub fn select<'a>(&'a self, bands: &'a [Band]) -> impl Iterator<Item = &'a T> + 'a {
        bands.iter().map(move |&band| &self[band])
    }
}
impl<T> Index<Band> for PerBand<T> {
    type Output = T;

    fn index(&self, band: Band) -> &Self::Output {
        &self.0[band.index()]
    }
}
impl<T> IndexMut<Band> for PerBand<T> {
    fn index_mut(&mut self, band: Band) -> &mut Self::Output {
        &mut self.0[band.index()]
    }
}
impl<T> From<[T; Band::COUNT]> for PerBand<T> {
    fn from(values: [T; Band::COUNT]) -> Self {
        Self(values)
    }
}
impl fmt::Display for PerBand<f64> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self
            .iter()
            .map(|(band, value)| format!("{}:{:.3}", band, value))
            .collect();
        write!(f, "[{}]", values.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_names() {
        assert_eq!(Band::I.to_string(), "i");
        assert_eq!(Band::from_str("R").unwrap(), Band::R);
        assert_eq!(Band::G.flux_column(), "flux_g");
        assert_eq!(Band::Z.ratio_column(), "z peak/noise");
    }

    #[test]
    fn band_list() {
        assert_eq!(
            parse_bands("g, r,i").unwrap(),
            vec![Band::G, Band::R, Band::I]
        );
        assert!(parse_bands("g,q").is_err());
    }

    #[test]
    fn per_band_indexing() {
        let mut flux = PerBand::splat(f64::NAN);
        flux[Band::R] = 12.;
        assert_eq!(flux[Band::R], 12.);
        assert!(flux[Band::I].is_nan());
        let selected: Vec<f64> = flux.select(&[Band::R]).cloned().collect();
        assert_eq!(selected, vec![12.]);
    }
}
