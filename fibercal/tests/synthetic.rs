//! End-to-end calibration tests on synthetic pseudo-slit exposures with
//! known ground truth.

use approx::assert_relative_eq;
use slit_math::Polynomial;
use synthslit::{ArcLine, SlitScene};

use fibercal::{
    calibrate_arc, calibrate_flat, reduce, DetectorImage, LineCatalog, MatchPolicy, SlitConfig,
    SmoothingKind, TraceParams, WavecalParams, WavelengthGrid,
};

const ROWS: usize = 121;
const COLS: usize = 100;
const REFERENCE_ROW: usize = 60;
const FIBERS: usize = 8;

fn test_scene() -> SlitScene {
    SlitScene::uniform(ROWS, COLS, REFERENCE_ROW, FIBERS, 12.0, 10.0)
        .with_curvature(0.02, 0.0005)
        .with_background(50.0)
}

fn test_config() -> SlitConfig {
    SlitConfig {
        fiber_count: FIBERS,
        reference_row: REFERENCE_ROW,
        rows_above: 55,
        rows_below: 55,
        trace_step: 1,
        search_radius: 2,
        smoothing_half_width: 3,
        smoothing: SmoothingKind::Median,
        detection_sigma: 2.0,
        min_separation: 4.0,
        identify_tolerance: 2.0,
        extraction_half_width: 2.5,
        short_trace_radius: 10,
        align_match_radius: 2.0,
        zero_order_column: None,
        trace: TraceParams {
            order: 2,
            tolerance: 0.3,
            reject_fraction: 0.3,
            max_iterations: 10,
        },
    }
}

/// Linear ground-truth dispersion: wavelength = 4000 + 2.5 * row.
fn truth_dispersion() -> Polynomial {
    Polynomial::new(vec![4000.0, 2.5])
}

fn arc_lines() -> Vec<ArcLine> {
    [4050.0, 4120.0, 4180.0, 4240.0, 4280.0]
        .iter()
        .map(|&wavelength| ArcLine {
            wavelength,
            strength: 40.0,
        })
        .collect()
}

fn test_grid() -> WavelengthGrid {
    WavelengthGrid {
        start: 4010.0,
        step: 2.0,
        bins: 140,
    }
}

fn wavecal_params() -> WavecalParams {
    WavecalParams {
        order: 2,
        max_rms_px: 0.2,
        match_window: 5.0,
        detection_sigma: 3.0,
        min_separation: 3.0,
        policy: MatchPolicy::FirstGuess,
        scan_span: 0.05,
        scan_steps: 101,
        max_iterations: 5,
    }
}

#[test]
fn test_flat_calibration_recovers_geometry() {
    let _ = env_logger::builder().is_test(true).try_init();
    let scene = test_scene().with_noise(2.0, 11);
    let flat = DetectorImage::new(scene.render_flat()).unwrap();
    let cfg = test_config();

    let cal = calibrate_flat(&flat, None, &cfg).unwrap();
    assert_eq!(cal.traces.len(), FIBERS);
    assert_eq!(cal.traces.lost_count(), 0);

    // Model at the reference row reproduces the identified column.
    for (fiber, &column) in cal.fiber_map.columns.iter().enumerate() {
        let modeled = cal.traces.column_at(fiber, REFERENCE_ROW as f64).unwrap();
        assert!(
            (modeled - column).abs() < 0.05,
            "fiber {fiber}: model {modeled} vs identified {column}"
        );
    }

    // Model follows the injected curvature across the detector.
    for fiber in 0..FIBERS {
        for row in (10..=110).step_by(10) {
            let truth = scene.column_at(fiber, row as f64);
            let modeled = cal.traces.column_at(fiber, row as f64).unwrap();
            assert!(
                (modeled - truth).abs() < 0.1,
                "fiber {fiber} row {row}: model {modeled} vs truth {truth}"
            );
        }
    }
}

#[test]
fn test_arc_calibration_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let scene = test_scene();
    let flat = DetectorImage::new(scene.render_flat()).unwrap();
    let cfg = test_config();
    let cal = calibrate_flat(&flat, None, &cfg).unwrap();

    // Arc exposure of the same slit, shifted by instrument flexure.
    let arc_scene = scene.shifted(1.5);
    let dispersion = truth_dispersion();
    let arc = DetectorImage::new(arc_scene.render_arc(&dispersion, &arc_lines(), 1.2, 5.0))
        .unwrap();

    let catalog =
        LineCatalog::new(arc_lines().iter().map(|l| l.wavelength).collect()).unwrap();
    let grid = test_grid();
    let result = calibrate_arc(
        &arc,
        &cal,
        &catalog,
        &dispersion,
        &cfg,
        &wavecal_params(),
        &grid,
        (4050.0, 4250.0),
    )
    .unwrap();

    // Flexure recovered by the aligner.
    let alignment = result.alignment.expect("alignment should succeed");
    assert_relative_eq!(alignment.dc0, 1.5, epsilon = 0.1);
    assert_relative_eq!(alignment.dc1, 0.0, epsilon = 0.01);

    // Every fiber has a wavelength solution reproducing the dispersion.
    assert_eq!(result.ids.lost_count(), 0);
    for ids in &result.ids.solutions {
        let poly = ids.poly.as_ref().unwrap();
        for row in [20.0, 60.0, 100.0] {
            assert!(
                (poly.eval(row) - dispersion.eval(row)).abs() < 1.0,
                "fiber {}: IDS {} vs truth {} at row {row}",
                ids.fiber,
                poly.eval(row),
                dispersion.eval(row)
            );
        }
        assert!(ids.rms_px.unwrap() < 0.2);
    }

    // Round trip: resampling the arc recovers the injected line wavelengths.
    let arc_extracted =
        fibercal::extract_spectra(&arc, &result.arc_traces, cfg.extraction_half_width);
    let arc_resampled = fibercal::resample(&arc_extracted, &result.ids, &grid);
    for fiber in 0..FIBERS {
        assert!(arc_resampled.valid[fiber]);
        for line in arc_lines() {
            let target_bin = ((line.wavelength - grid.start) / grid.step).round() as usize;
            let lo = target_bin.saturating_sub(4);
            let hi = (target_bin + 4).min(grid.bins - 1);
            let best = (lo..=hi)
                .max_by(|&a, &b| {
                    arc_resampled.flux[[fiber, a]]
                        .partial_cmp(&arc_resampled.flux[[fiber, b]])
                        .unwrap()
                })
                .unwrap();
            let recovered = grid.wavelength_at(best);
            assert!(
                (recovered - line.wavelength).abs() <= grid.step,
                "fiber {fiber}: line {} recovered at {recovered}",
                line.wavelength
            );
        }
    }
}

#[test]
fn test_transmission_factors_match_throughput() {
    let _ = env_logger::builder().is_test(true).try_init();
    let amplitudes = vec![900.0, 950.0, 1000.0, 1050.0, 1100.0, 1000.0, 980.0, 1020.0];
    let scene = test_scene().with_amplitudes(amplitudes.clone());
    let flat = DetectorImage::new(scene.render_flat()).unwrap();
    let cfg = test_config();
    let cal = calibrate_flat(&flat, None, &cfg).unwrap();

    let dispersion = truth_dispersion();
    let arc = DetectorImage::new(
        scene
            .shifted(0.5)
            .render_arc(&dispersion, &arc_lines(), 1.2, 5.0),
    )
    .unwrap();
    let catalog =
        LineCatalog::new(arc_lines().iter().map(|l| l.wavelength).collect()).unwrap();
    let result = calibrate_arc(
        &arc,
        &cal,
        &catalog,
        &dispersion,
        &cfg,
        &wavecal_params(),
        &test_grid(),
        (4050.0, 4250.0),
    )
    .unwrap();

    // The flat background is constant, so after background influence the
    // factors track the injected throughput ratios.
    let mean = amplitudes.iter().sum::<f64>() / amplitudes.len() as f64;
    assert_eq!(result.transmission.lost_count(), 0);
    for (fiber, &amp) in amplitudes.iter().enumerate() {
        let expected = amp / mean;
        let got = result.transmission.factors[fiber];
        assert!(
            (got - expected).abs() < 0.05,
            "fiber {fiber}: factor {got} vs expected {expected}"
        );
    }
}

#[test]
fn test_reduce_equalizes_fiber_throughput() {
    let _ = env_logger::builder().is_test(true).try_init();
    let amplitudes = vec![900.0, 950.0, 1000.0, 1050.0, 1100.0, 1000.0, 980.0, 1020.0];
    let scene = test_scene().with_amplitudes(amplitudes);
    let flat = DetectorImage::new(scene.render_flat()).unwrap();
    let cfg = test_config();
    let cal = calibrate_flat(&flat, None, &cfg).unwrap();

    let dispersion = truth_dispersion();
    let arc = DetectorImage::new(
        scene
            .shifted(0.5)
            .render_arc(&dispersion, &arc_lines(), 1.2, 5.0),
    )
    .unwrap();
    let catalog =
        LineCatalog::new(arc_lines().iter().map(|l| l.wavelength).collect()).unwrap();
    let grid = test_grid();
    let dispersion_cal = calibrate_arc(
        &arc,
        &cal,
        &catalog,
        &dispersion,
        &cfg,
        &wavecal_params(),
        &grid,
        (4050.0, 4250.0),
    )
    .unwrap();

    // A science exposure with the same throughput pattern: after the
    // transmission correction all fibers carry the same flux.
    let science = DetectorImage::new(scene.shifted(0.8).render_flat()).unwrap();
    let (spectra, qc) = reduce(&science, &cal, &dispersion_cal, &cfg, &grid).unwrap();
    assert_eq!(qc.get("reduce.lost"), Some(&fibercal::QcValue::Count(0)));

    let central_bin = grid.bins / 2;
    let reference = spectra.flux[[2, central_bin]];
    for fiber in 0..FIBERS {
        assert!(spectra.valid[fiber]);
        let value = spectra.flux[[fiber, central_bin]];
        assert!(
            (value / reference - 1.0).abs() < 0.05,
            "fiber {fiber}: corrected flux {value} vs reference {reference}"
        );
    }
}
