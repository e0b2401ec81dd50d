//! Benchmarks for compositing, pixel trends and regional aggregation

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use geo_types::polygon;
use std::sync::Arc;
use terratrend_algorithms::compositing::{
    seasonal_composite, CompositeParams, CompositeStatus, FallbackPolicy, Reducer,
};
use terratrend_algorithms::statistics::{aggregate, fit_pixel_trend, ZonalParams};
use terratrend_core::raster::{GridSpec, StudyArea};
use terratrend_core::temporal::{RasterFrame, SeasonalWindow};
use terratrend_core::{GeoTransform, Raster, Region};

fn grid(size: usize) -> GridSpec {
    GridSpec::new(size, size, GeoTransform::new(0.0, size as f64, 1.0, -1.0))
}

fn create_band(size: usize, base: f64) -> Raster<f64> {
    let mut r = Raster::for_grid(&grid(size), 0.0);
    for ((row, col), v) in r.data_mut().indexed_iter_mut() {
        *v = base + ((row * 7 + col * 13) % 200) as f64;
    }
    r
}

/// Twelve monthly frames of one year
fn frames(size: usize, year: i32) -> Vec<RasterFrame> {
    (1..=12)
        .map(|m| {
            RasterFrame::new(NaiveDate::from_ymd_opt(year, m, 15).unwrap())
                .with_band("b", create_band(size, f64::from(m)))
        })
        .collect()
}

fn params(reducer: Reducer) -> CompositeParams {
    CompositeParams {
        band: "b".into(),
        reducer,
        window: SeasonalWindow::from_month_days((3, 1), (9, 30)).unwrap(),
        fallback_value: 0.0,
    }
}

fn bench_composite(c: &mut Criterion) {
    let mut group = c.benchmark_group("compositing/seasonal");
    for size in [256, 512, 1024] {
        let frames = frames(size, 2020);
        let study = StudyArea::full(grid(size));
        for reducer in [Reducer::Sum, Reducer::Median] {
            group.bench_with_input(BenchmarkId::new(reducer.to_string(), size), &size, |b, _| {
                b.iter(|| seasonal_composite(black_box(&frames), &study, 2020, &params(reducer)).unwrap())
            });
        }
    }
    group.finish();
}

fn bench_pixel_trend(c: &mut Criterion) {
    let mut group = c.benchmark_group("statistics/pixel_trend");
    for size in [256, 512] {
        let study = StudyArea::full(grid(size));
        let series: Vec<_> = (2000..2020)
            .map(|y| {
                let composite = seasonal_composite(&frames(size, y), &study, y, &params(Reducer::Sum)).unwrap();
                assert_eq!(composite.status(), CompositeStatus::Data);
                (y, Arc::new(composite))
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| fit_pixel_trend(black_box(&series), FallbackPolicy::Exclude).unwrap())
        });
    }
    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("statistics/aggregate");
    let size = 1024;
    let raster = create_band(size, 0.0);
    let s = size as f64;
    let region = Region::from_polygon(
        "tri",
        polygon![(x: 0.05 * s, y: 0.05 * s), (x: 0.95 * s, y: 0.1 * s), (x: 0.5 * s, y: 0.95 * s)],
    );
    for tile_factor in [1, 4, 16] {
        let p = ZonalParams {
            tile_factor,
            ..Default::default()
        };
        group.bench_with_input(BenchmarkId::new("tile_factor", tile_factor), &tile_factor, |b, _| {
            b.iter(|| aggregate(black_box(&raster), &region, &p).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_composite, bench_pixel_trend, bench_aggregate);
criterion_main!(benches);
