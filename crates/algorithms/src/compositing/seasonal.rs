//! Seasonal compositing with a uniform fallback policy
//!
//! Reduces the frames of one year's seasonal window to a single raster.
//! Every requested year yields exactly one [`CompositeImage`]: when the window
//! holds no frames, when none of them carries the band, or when the reduction
//! leaves no unmasked pixel inside the study area, the composite is a
//! constant raster tagged `FALLBACK`. Downstream stages branch on that tag
//! instead of special-casing missing years.

use crate::compositing::Reducer;
use crate::maybe_rayon::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use terratrend_core::raster::{GridSpec, Raster, StudyArea};
use terratrend_core::temporal::{DateRange, MonthDay, RasterFrame, SeasonalWindow};
use terratrend_core::{Algorithm, Error, Result};
use tracing::{debug, trace, warn};

/// Conventional constant of fallback composites
pub const DEFAULT_FALLBACK_VALUE: f64 = 0.0;

/// Stages every (year) or (region, year) unit passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStage {
    RawFramesFiltered,
    Aggregated,
    BandPresenceChecked,
    DataPresenceChecked,
    Finalized(CompositeStatus),
}

impl fmt::Display for UnitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStage::RawFramesFiltered => f.write_str("RAW_FRAMES_FILTERED"),
            UnitStage::Aggregated => f.write_str("AGGREGATED"),
            UnitStage::BandPresenceChecked => f.write_str("BAND_PRESENCE_CHECKED"),
            UnitStage::DataPresenceChecked => f.write_str("DATA_PRESENCE_CHECKED"),
            UnitStage::Finalized(status) => write!(f, "FINALIZED({status})"),
        }
    }
}

/// Data-presence flag of a composite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompositeStatus {
    Data,
    Fallback,
}

impl fmt::Display for CompositeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositeStatus::Data => f.write_str("DATA"),
            CompositeStatus::Fallback => f.write_str("FALLBACK"),
        }
    }
}

/// Why a composite fell back to the constant raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// No frame fell inside the seasonal window
    NoFrames,
    /// Frames existed but none carried the requested band
    BandAbsent,
    /// The reduction left no unmasked pixel inside the study area
    NoValidPixels,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoFrames => f.write_str("no frames in seasonal window"),
            FallbackReason::BandAbsent => f.write_str("band absent from aggregation result"),
            FallbackReason::NoValidPixels => f.write_str("no unmasked pixels inside study area"),
        }
    }
}

/// How downstream stages treat `FALLBACK` composites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Fallback years are null points: skipped by means and trend fits
    #[default]
    Exclude,
    /// Fallback years contribute their constant value
    AsConstant,
}

/// Either a computed reduction or the flagged constant substitute
#[derive(Debug, Clone)]
pub enum CompositeContent {
    Computed(Raster<f64>),
    Fallback {
        raster: Raster<f64>,
        value: f64,
        reason: FallbackReason,
    },
}

/// One seasonal composite for one (year, band). Never mutated after creation.
#[derive(Debug, Clone)]
pub struct CompositeImage {
    pub year: i32,
    pub band: String,
    pub reducer: Reducer,
    /// Frames that fell inside the window, whatever the outcome
    pub source_frame_count: usize,
    pub window: DateRange,
    pub content: CompositeContent,
}

impl CompositeImage {
    pub fn status(&self) -> CompositeStatus {
        match self.content {
            CompositeContent::Computed(_) => CompositeStatus::Data,
            CompositeContent::Fallback { .. } => CompositeStatus::Fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.status() == CompositeStatus::Fallback
    }

    pub fn fallback_reason(&self) -> Option<FallbackReason> {
        match self.content {
            CompositeContent::Fallback { reason, .. } => Some(reason),
            CompositeContent::Computed(_) => None,
        }
    }

    /// Pixel values, whatever the status
    pub fn raster(&self) -> &Raster<f64> {
        match &self.content {
            CompositeContent::Computed(raster) => raster,
            CompositeContent::Fallback { raster, .. } => raster,
        }
    }

    /// Pixel values a downstream stage may consume under `policy`
    pub fn usable_raster(&self, policy: FallbackPolicy) -> Option<&Raster<f64>> {
        match (&self.content, policy) {
            (CompositeContent::Computed(raster), _) => Some(raster),
            (CompositeContent::Fallback { raster, .. }, FallbackPolicy::AsConstant) => Some(raster),
            (CompositeContent::Fallback { .. }, FallbackPolicy::Exclude) => None,
        }
    }

    /// Spatial extent of the composite
    pub fn extent(&self) -> GridSpec {
        self.raster().grid()
    }

    /// Key/value description stored next to the pixels on export, so a
    /// `FALLBACK` constant stays distinguishable from a computed image
    pub fn metadata(&self) -> Vec<(String, String)> {
        let mut items = vec![
            ("STATUS".to_string(), self.status().to_string()),
            ("YEAR".to_string(), self.year.to_string()),
            ("BAND".to_string(), self.band.clone()),
            ("REDUCER".to_string(), self.reducer.to_string()),
            ("WINDOW".to_string(), self.window.to_string()),
            ("SOURCE_FRAME_COUNT".to_string(), self.source_frame_count.to_string()),
        ];
        if let CompositeContent::Fallback { reason, value, .. } = &self.content {
            items.push(("FALLBACK_REASON".to_string(), reason.to_string()));
            items.push(("FALLBACK_VALUE".to_string(), value.to_string()));
        }
        items
    }
}

/// Parameters for seasonal compositing
#[derive(Debug, Clone)]
pub struct CompositeParams {
    pub band: String,
    pub reducer: Reducer,
    pub window: SeasonalWindow,
    /// Constant of fallback composites
    pub fallback_value: f64,
}

impl Default for CompositeParams {
    fn default() -> Self {
        Self {
            band: String::new(),
            reducer: Reducer::Sum,
            window: SeasonalWindow::new(
                MonthDay { month: 1, day: 1 },
                MonthDay { month: 12, day: 31 },
            ),
            fallback_value: DEFAULT_FALLBACK_VALUE,
        }
    }
}

/// Input of [`SeasonalCompositor`]
#[derive(Debug, Clone)]
pub struct CompositeInput {
    pub frames: Vec<RasterFrame>,
    pub study: StudyArea,
    pub year: i32,
}

/// Seasonal compositor
#[derive(Debug, Clone, Default)]
pub struct SeasonalCompositor;

impl Algorithm for SeasonalCompositor {
    type Input = CompositeInput;
    type Output = CompositeImage;
    type Params = CompositeParams;
    type Error = Error;

    fn name(&self) -> &'static str {
        "SeasonalComposite"
    }

    fn description(&self) -> &'static str {
        "Reduce the frames of a yearly seasonal window to one flagged composite"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        seasonal_composite(&input.frames, &input.study, input.year, &params)
    }
}

fn fallback(study: &StudyArea, value: f64) -> Raster<f64> {
    let mut raster = Raster::for_grid(study.grid(), f64::NAN);
    for ((row, col), cell) in raster.data_mut().indexed_iter_mut() {
        if study.contains(row, col) {
            *cell = value;
        }
    }
    raster.set_nodata(Some(f64::NAN));
    raster
}

/// Composite the frames of `year`'s seasonal window.
///
/// `frames` may span any date range; only those inside the window are used.
/// Frames whose band raster is not on the study grid abort the unit with
/// `SizeMismatch`. Absence of data never errors: it yields a `FALLBACK`
/// composite.
pub fn seasonal_composite(
    frames: &[RasterFrame],
    study: &StudyArea,
    year: i32,
    params: &CompositeParams,
) -> Result<CompositeImage> {
    let window = params.window.range_for(year)?;
    let grid = *study.grid();

    let in_window: Vec<&RasterFrame> = frames.iter().filter(|f| window.contains(f.date())).collect();
    let source_frame_count = in_window.len();
    trace!(year, stage = %UnitStage::RawFramesFiltered, frames = source_frame_count);

    let finish = |content: CompositeContent| {
        let image = CompositeImage {
            year,
            band: params.band.clone(),
            reducer: params.reducer,
            source_frame_count,
            window,
            content,
        };
        debug!(
            year,
            band = %image.band,
            frames = source_frame_count,
            stage = %UnitStage::Finalized(image.status()),
            reason = ?image.fallback_reason(),
            "composite finalized"
        );
        if let Some(reason) = image.fallback_reason() {
            warn!(year, band = %image.band, %reason, value = params.fallback_value, "composite fell back to constant");
        }
        image
    };
    let fall_back = |reason: FallbackReason| {
        finish(CompositeContent::Fallback {
            raster: fallback(study, params.fallback_value),
            value: params.fallback_value,
            reason,
        })
    };

    if in_window.is_empty() {
        return Ok(fall_back(FallbackReason::NoFrames));
    }

    let bands: Vec<&Raster<f64>> = in_window.iter().filter_map(|f| f.band(&params.band)).collect();
    for band in &bands {
        band.ensure_shape(grid.rows, grid.cols)?;
    }

    let (rows, cols) = (grid.rows, grid.cols);
    let reducer = params.reducer;
    let data: Vec<f64> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut out = Vec::with_capacity(cols);
            let mut obs = Vec::with_capacity(bands.len());
            for col in 0..cols {
                if !study.contains(row, col) {
                    out.push(f64::NAN);
                    continue;
                }
                obs.clear();
                for band in &bands {
                    let v = unsafe { band.get_unchecked(row, col) };
                    if v.is_finite() && !band.is_nodata(v) {
                        obs.push(v);
                    }
                }
                out.push(reducer.reduce(&mut obs).unwrap_or(f64::NAN));
            }
            out
        })
        .collect();
    trace!(year, stage = %UnitStage::Aggregated, bands = bands.len());

    if bands.is_empty() {
        return Ok(fall_back(FallbackReason::BandAbsent));
    }
    trace!(year, stage = %UnitStage::BandPresenceChecked);

    let mut raster = Raster::from_vec(data, rows, cols)?;
    raster.set_transform(grid.transform);
    raster.set_nodata(Some(f64::NAN));

    if raster.valid_count() == 0 {
        return Ok(fall_back(FallbackReason::NoValidPixels));
    }
    trace!(year, stage = %UnitStage::DataPresenceChecked);

    Ok(finish(CompositeContent::Computed(raster)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use geo_types::{polygon, MultiPolygon};
    use terratrend_core::GeoTransform;

    fn grid() -> GridSpec {
        GridSpec::new(3, 3, GeoTransform::new(0.0, 3.0, 1.0, -1.0))
    }

    fn frame(y: i32, m: u32, d: u32, value: f64) -> RasterFrame {
        let mut band = Raster::for_grid(&grid(), value);
        band.set_nodata(Some(f64::NAN));
        RasterFrame::new(NaiveDate::from_ymd_opt(y, m, d).unwrap()).with_band("precip", band)
    }

    fn params(reducer: Reducer) -> CompositeParams {
        CompositeParams {
            band: "precip".into(),
            reducer,
            window: SeasonalWindow::from_month_days((3, 1), (9, 30)).unwrap(),
            fallback_value: 0.0,
        }
    }

    #[test]
    fn test_sum_within_window_only() {
        let frames = vec![
            frame(2020, 2, 28, 100.0),
            frame(2020, 3, 1, 1.0),
            frame(2020, 6, 15, 2.0),
            frame(2020, 9, 30, 3.0),
            frame(2020, 10, 1, 100.0),
        ];
        let study = StudyArea::full(grid());
        let c = seasonal_composite(&frames, &study, 2020, &params(Reducer::Sum)).unwrap();

        assert_eq!(c.status(), CompositeStatus::Data);
        assert_eq!(c.source_frame_count, 3);
        assert_eq!(c.raster().get(1, 1).unwrap(), 6.0);
    }

    #[test]
    fn test_no_frames_falls_back() {
        let frames = vec![frame(2019, 5, 1, 4.0)];
        let study = StudyArea::full(grid());
        let c = seasonal_composite(&frames, &study, 2020, &params(Reducer::Median)).unwrap();

        assert!(c.is_fallback());
        assert_eq!(c.fallback_reason(), Some(FallbackReason::NoFrames));
        assert_eq!(c.source_frame_count, 0);
        assert!(c.raster().data().iter().all(|&v| v == 0.0));
        assert!(c.usable_raster(FallbackPolicy::Exclude).is_none());
        assert!(c.usable_raster(FallbackPolicy::AsConstant).is_some());
    }

    #[test]
    fn test_band_absent_falls_back_but_counts_frames() {
        let other = RasterFrame::new(NaiveDate::from_ymd_opt(2020, 4, 1).unwrap())
            .with_band("evap", Raster::for_grid(&grid(), 1.0));
        let study = StudyArea::full(grid());
        let c = seasonal_composite(&[other], &study, 2020, &params(Reducer::Sum)).unwrap();

        assert_eq!(c.fallback_reason(), Some(FallbackReason::BandAbsent));
        assert_eq!(c.source_frame_count, 1);
    }

    #[test]
    fn test_all_masked_falls_back() {
        let frames = vec![frame(2020, 4, 1, f64::NAN), frame(2020, 5, 1, f64::NAN)];
        let study = StudyArea::full(grid());
        let c = seasonal_composite(&frames, &study, 2020, &params(Reducer::Mean)).unwrap();

        assert_eq!(c.fallback_reason(), Some(FallbackReason::NoValidPixels));
        assert_eq!(c.source_frame_count, 2);
    }

    #[test]
    fn test_restricted_to_study_geometry() {
        // Covers only the centre pixel (centre at 1.5, 1.5)
        let square = polygon![(x: 1.0, y: 1.0), (x: 2.0, y: 1.0), (x: 2.0, y: 2.0), (x: 1.0, y: 2.0)];
        let study = StudyArea::with_geometry(grid(), MultiPolygon(vec![square])).unwrap();
        let frames = vec![frame(2020, 4, 1, 5.0)];
        let c = seasonal_composite(&frames, &study, 2020, &params(Reducer::Max)).unwrap();

        assert_eq!(c.raster().valid_count(), 1);
        assert_eq!(c.raster().get(1, 1).unwrap(), 5.0);
        assert!(c.raster().get(0, 0).unwrap().is_nan());

        let empty = seasonal_composite(&[], &study, 2020, &params(Reducer::Max)).unwrap();
        assert_eq!(empty.raster().valid_count(), 1);
    }

    #[test]
    fn test_partial_masks_reduce_remaining_observations() {
        let mut holey = Raster::for_grid(&grid(), 10.0);
        holey.set(0, 0, f64::NAN).unwrap();
        let frames = vec![
            RasterFrame::new(NaiveDate::from_ymd_opt(2020, 4, 1).unwrap()).with_band("precip", holey),
            frame(2020, 5, 1, 2.0),
        ];
        let study = StudyArea::full(grid());
        let c = seasonal_composite(&frames, &study, 2020, &params(Reducer::Mean)).unwrap();
        assert_eq!(c.raster().get(0, 0).unwrap(), 2.0);
        assert_eq!(c.raster().get(2, 2).unwrap(), 6.0);
    }

    #[test]
    fn test_off_grid_frame_is_fatal() {
        let bad = RasterFrame::new(NaiveDate::from_ymd_opt(2020, 4, 1).unwrap())
            .with_band("precip", Raster::filled(2, 2, 1.0));
        let study = StudyArea::full(grid());
        let result = seasonal_composite(&[bad], &study, 2020, &params(Reducer::Sum));
        assert!(matches!(result, Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn test_algorithm_trait() {
        let input = CompositeInput {
            frames: vec![frame(2021, 7, 1, 4.0)],
            study: StudyArea::full(grid()),
            year: 2021,
        };
        let c = SeasonalCompositor.execute(input, params(Reducer::Sum)).unwrap();
        assert_eq!(c.year, 2021);
        assert_eq!(c.extent(), grid());
    }

    #[test]
    fn test_metadata_flags_fallback() {
        let study = StudyArea::full(grid());
        let empty = seasonal_composite(&[], &study, 2020, &params(Reducer::Sum)).unwrap();
        let items: std::collections::BTreeMap<_, _> = empty.metadata().into_iter().collect();
        assert_eq!(items["STATUS"], "FALLBACK");
        assert_eq!(items["FALLBACK_REASON"], FallbackReason::NoFrames.to_string());
        assert_eq!(items["SOURCE_FRAME_COUNT"], "0");

        let full = seasonal_composite(&[frame(2020, 5, 1, 2.0)], &study, 2020, &params(Reducer::Sum)).unwrap();
        let items: std::collections::BTreeMap<_, _> = full.metadata().into_iter().collect();
        assert_eq!(items["STATUS"], "DATA");
        assert!(!items.contains_key("FALLBACK_REASON"));
    }
}
