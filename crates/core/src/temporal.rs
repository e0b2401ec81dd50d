//! Dated raster frames and seasonal windows

use crate::error::{Error, Result};
use crate::raster::Raster;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A calendar month/day pair, independent of the year
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    /// Validated month/day. Feb 29 is accepted.
    pub fn new(month: u32, day: u32) -> Result<Self> {
        // 2000 is a leap year, so every real month/day combination exists in it
        if NaiveDate::from_ymd_opt(2000, month, day).is_none() {
            return Err(Error::InvalidParameter {
                name: "month_day",
                value: format!("{month:02}-{day:02}"),
                reason: "not a calendar day".to_string(),
            });
        }
        Ok(Self { month, day })
    }

    /// This month/day in `year`; Feb 29 falls back to Feb 28 in common years
    pub fn in_year(&self, year: i32) -> Result<NaiveDate> {
        NaiveDate::from_ymd_opt(year, self.month, self.day)
            .or_else(|| {
                (self.month == 2 && self.day == 29)
                    .then(|| NaiveDate::from_ymd_opt(year, 2, 28))
                    .flatten()
            })
            .ok_or_else(|| Error::InvalidParameter {
                name: "month_day",
                value: format!("{year}-{:02}-{:02}", self.month, self.day),
                reason: "date out of range".to_string(),
            })
    }
}

impl fmt::Display for MonthDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

/// Inclusive date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidParameter {
                name: "date_range",
                value: format!("{start}..{end}"),
                reason: "end precedes start".to_string(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Smallest range covering both
    pub fn union(&self, other: &DateRange) -> DateRange {
        DateRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A month/day window reapplied identically to every calendar year.
///
/// When `end` precedes `start` the window wraps the new year: the window
/// for year `Y` runs from `start` in `Y` to `end` in `Y + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonalWindow {
    pub start: MonthDay,
    pub end: MonthDay,
}

impl SeasonalWindow {
    pub fn new(start: MonthDay, end: MonthDay) -> Self {
        Self { start, end }
    }

    /// Convenience constructor from raw month/day numbers
    pub fn from_month_days(start: (u32, u32), end: (u32, u32)) -> Result<Self> {
        Ok(Self::new(MonthDay::new(start.0, start.1)?, MonthDay::new(end.0, end.1)?))
    }

    /// Whether the window crosses the new year
    pub fn wraps_year(&self) -> bool {
        self.end < self.start
    }

    /// Concrete date range of the window for one year
    pub fn range_for(&self, year: i32) -> Result<DateRange> {
        let end_year = if self.wraps_year() {
            year.checked_add(1).ok_or_else(|| Error::InvalidParameter {
                name: "year",
                value: year.to_string(),
                reason: "window wraps past the last representable year".to_string(),
            })?
        } else {
            year
        };
        DateRange::new(self.start.in_year(year)?, self.end.in_year(end_year)?)
    }

    /// Date range covering the windows of every year in `first..=last`
    pub fn span(&self, first: i32, last: i32) -> Result<DateRange> {
        Ok(self.range_for(first)?.union(&self.range_for(last)?))
    }
}

impl fmt::Display for SeasonalWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A timestamped set of co-registered bands over the dataset grid.
///
/// Frames are immutable once built; band rasters are shared behind `Arc`
/// so cloning a frame never copies pixels.
#[derive(Debug, Clone)]
pub struct RasterFrame {
    date: NaiveDate,
    bands: BTreeMap<String, Arc<Raster<f64>>>,
    properties: BTreeMap<String, String>,
}

impl RasterFrame {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            bands: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style band insertion
    pub fn with_band(mut self, name: impl Into<String>, raster: Raster<f64>) -> Self {
        self.bands.insert(name.into(), Arc::new(raster));
        self
    }

    /// Builder-style metadata insertion
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn year(&self) -> i32 {
        self.date.year()
    }

    pub fn band(&self, name: &str) -> Option<&Raster<f64>> {
        self.bands.get(name).map(Arc::as_ref)
    }

    pub fn band_names(&self) -> impl Iterator<Item = &str> {
        self.bands.keys().map(String::as_str)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Copy of this frame restricted to the named bands
    pub fn select(&self, names: &[&str]) -> RasterFrame {
        RasterFrame {
            date: self.date,
            bands: self
                .bands
                .iter()
                .filter(|(k, _)| names.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect(),
            properties: self.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_window_range() {
        let window = SeasonalWindow::from_month_days((3, 1), (9, 30)).unwrap();
        let range = window.range_for(2023).unwrap();
        assert_eq!(range.start, date(2023, 3, 1));
        assert_eq!(range.end, date(2023, 9, 30));
        assert!(range.contains(date(2023, 9, 30)));
        assert!(!range.contains(date(2023, 10, 1)));
        assert!(!window.wraps_year());
    }

    #[test]
    fn test_window_wrapping_year() {
        let window = SeasonalWindow::from_month_days((11, 1), (2, 28)).unwrap();
        assert!(window.wraps_year());
        let range = window.range_for(2020).unwrap();
        assert_eq!(range.start, date(2020, 11, 1));
        assert_eq!(range.end, date(2021, 2, 28));
    }

    #[test]
    fn test_wrapping_window_at_year_limit() {
        let window = SeasonalWindow::from_month_days((11, 1), (2, 28)).unwrap();
        assert!(matches!(
            window.range_for(i32::MAX),
            Err(Error::InvalidParameter { name: "year", .. })
        ));
        let plain = SeasonalWindow::from_month_days((3, 1), (9, 30)).unwrap();
        assert!(plain.range_for(i32::MAX).is_err());
    }

    #[test]
    fn test_leap_day_clamps() {
        let window = SeasonalWindow::from_month_days((1, 1), (2, 29)).unwrap();
        assert_eq!(window.range_for(2021).unwrap().end, date(2021, 2, 28));
        assert_eq!(window.range_for(2024).unwrap().end, date(2024, 2, 29));
    }

    #[test]
    fn test_invalid_month_day() {
        assert!(MonthDay::new(13, 1).is_err());
        assert!(MonthDay::new(4, 31).is_err());
        assert!(MonthDay::new(2, 29).is_ok());
    }

    #[test]
    fn test_span_covers_all_years() {
        let window = SeasonalWindow::from_month_days((3, 1), (9, 30)).unwrap();
        let span = window.span(1981, 2022).unwrap();
        assert_eq!(span.start, date(1981, 3, 1));
        assert_eq!(span.end, date(2022, 9, 30));
    }

    #[test]
    fn test_frame_select() {
        let frame = RasterFrame::new(date(2020, 5, 1))
            .with_band("NDVI", Raster::filled(2, 2, 0.5))
            .with_band("EVI", Raster::filled(2, 2, 0.3))
            .with_property("platform", "terra");

        let only_ndvi = frame.select(&["NDVI"]);
        assert!(only_ndvi.band("NDVI").is_some());
        assert!(only_ndvi.band("EVI").is_none());
        assert_eq!(only_ndvi.property("platform"), Some("terra"));
        assert_eq!(frame.year(), 2020);
    }
}
