//! Rule validation for an arbitrary set of sources and measurement points.
//!
//! `validate` is a pure function: it never fails and never mutates its
//! input. It is cheap enough to run after every edit of a single point.

use std::collections::BTreeMap;

use crate::geometry::planar_distances;
use crate::model::{
    AxisFlags, Enclosure, LayoutRules, PointReport, SourcePoint, ViolationReport, measurement_label,
    source_label,
};
use crate::proximity::ProximityIndex;
use crate::types::{Axis, Vec3, grid_key};

/// Identifies a point inside the report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Source(usize),
    Measurement(usize),
}

/// Computes all rule violations of a point set.
///
/// Checks, applied to every active source and every measurement point:
/// 1. inside the polygon, at least `margin` from every wall, Z inside the margins
/// 2. no two active points share a rounded X, Y or Z value (Z scope per `rules.z_uniqueness`)
/// 3. two active sources keep `min_source_separation` on every plane and every axis
/// 4. measurement points keep `min_source_distance` from every active source
/// 5. measurement points keep `min_point_spacing` from each other
///
/// # Parameters
/// * `sources` - Source points; inactive ones are ignored
/// * `measurements` - Measurement points
/// * `enclosure` - The room
/// * `rules` - Margins and distances to enforce
pub fn validate(
    sources: &[SourcePoint],
    measurements: &[Vec3],
    enclosure: &Enclosure,
    rules: &LayoutRules,
) -> ViolationReport {
    let mut report = ViolationReport::empty(sources.len(), measurements.len());

    check_axis_uniqueness(sources, measurements, rules, &mut report);

    for (i, source) in sources.iter().enumerate() {
        if source.active {
            check_placement(&source.position, enclosure, rules, &mut report.sources[i]);
        }
    }
    for (i, point) in measurements.iter().enumerate() {
        check_placement(point, enclosure, rules, &mut report.measurements[i]);
    }

    check_source_separation(sources, rules, &mut report);
    check_source_distances(sources, measurements, rules, &mut report);
    check_point_spacing(measurements, rules, &mut report);

    report
}

/// Polygon, wall margin and height band of a single point.
fn check_placement(point: &Vec3, enclosure: &Enclosure, rules: &LayoutRules, entry: &mut PointReport) {
    let xy = axes(true, true, false);
    if !enclosure.contains_xy(point.xy()) {
        entry.flag(xy, "Outside the polygon (XY)");
    }
    if enclosure.wall_clearance(point.xy()) < rules.margin - rules.epsilon {
        entry.flag(xy, format!("Closer than {:.1} m to a wall (XY)", rules.margin));
    }
    if point.z < rules.margin - rules.epsilon
        || point.z > enclosure.height - rules.margin + rules.epsilon
    {
        entry.flag(axes(false, false, true), "Z outside margins");
    }
}

fn check_axis_uniqueness(
    sources: &[SourcePoint],
    measurements: &[Vec3],
    rules: &LayoutRules,
    report: &mut ViolationReport,
) {
    for axis in Axis::ALL {
        let include_sources = axis != Axis::Z || rules.sources_share_z_uniqueness();

        let mut groups: BTreeMap<i64, Vec<Slot>> = BTreeMap::new();
        if include_sources {
            for (i, source) in sources.iter().enumerate().filter(|(_, s)| s.active) {
                groups
                    .entry(grid_key(source.position.component(axis)))
                    .or_default()
                    .push(Slot::Source(i));
            }
        }
        for (i, point) in measurements.iter().enumerate() {
            groups
                .entry(grid_key(point.component(axis)))
                .or_default()
                .push(Slot::Measurement(i));
        }

        let flags = axis_flag(axis);
        let message = format!("{} repeated", axis.label());
        for members in groups.values().filter(|members| members.len() > 1) {
            for slot in members {
                entry_mut(report, *slot).flag(flags, message.clone());
            }
        }
    }
}

fn check_source_separation(sources: &[SourcePoint], rules: &LayoutRules, report: &mut ViolationReport) {
    let min = rules.min_source_separation;
    for i in 0..sources.len() {
        for j in i + 1..sources.len() {
            let (a, b) = (&sources[i], &sources[j]);
            if !a.active || !b.active {
                continue;
            }
            let pair = format!("{}-{}", source_label(i), source_label(j));
            let pd = planar_distances(&a.position, &b.position);
            let (pa, pb) = (&a.position, &b.position);

            let mut findings: Vec<(AxisFlags, String)> = Vec::new();
            for (plane, distance, flags) in [
                ("XY", pd.xy, axes(true, true, false)),
                ("XZ", pd.xz, axes(true, false, true)),
                ("YZ", pd.yz, axes(false, true, true)),
            ] {
                if distance < min - rules.epsilon {
                    findings.push((
                        flags,
                        format!("{} below {:.2} m in {} ({:.2} m)", pair, min, plane, distance),
                    ));
                }
            }
            for axis in Axis::ALL {
                let delta = (pa.component(axis) - pb.component(axis)).abs();
                if delta < min - rules.epsilon {
                    findings.push((
                        axis_flag(axis),
                        format!("{}: |{}| = {:.2} below {:.2} m", pair, axis.label(), delta, min),
                    ));
                }
            }

            for (flags, message) in findings {
                report.sources[i].flag(flags, message.clone());
                report.sources[j].flag(flags, message);
            }
        }
    }
}

fn check_source_distances(
    sources: &[SourcePoint],
    measurements: &[Vec3],
    rules: &LayoutRules,
    report: &mut ViolationReport,
) {
    for (p, point) in measurements.iter().enumerate() {
        for (s, source) in sources.iter().enumerate().filter(|(_, s)| s.active) {
            let distance = point.distance_to(&source.position);
            if distance < rules.min_source_distance - rules.epsilon {
                report.measurements[p].flag(
                    AxisFlags::ALL,
                    format!(
                        "Distance to {} below {:.1} m ({:.2} m)",
                        source_label(s),
                        rules.min_source_distance,
                        distance
                    ),
                );
            }
        }
    }
}

fn check_point_spacing(measurements: &[Vec3], rules: &LayoutRules, report: &mut ViolationReport) {
    let threshold = rules.min_point_spacing - rules.epsilon;
    let index = ProximityIndex::with_points(rules.min_point_spacing, measurements.iter().copied());
    for (i, j) in index.pairs_within(threshold) {
        let distance = measurements[i].distance_to(&measurements[j]);
        let message = format!(
            "{}-{} below {:.1} m ({:.2} m)",
            measurement_label(i),
            measurement_label(j),
            rules.min_point_spacing,
            distance
        );
        report.measurements[i].flag(AxisFlags::ALL, message.clone());
        report.measurements[j].flag(AxisFlags::ALL, message);
    }
}

fn entry_mut(report: &mut ViolationReport, slot: Slot) -> &mut PointReport {
    match slot {
        Slot::Source(i) => &mut report.sources[i],
        Slot::Measurement(i) => &mut report.measurements[i],
    }
}

#[inline]
fn axes(x: bool, y: bool, z: bool) -> AxisFlags {
    AxisFlags { x, y, z }
}

#[inline]
fn axis_flag(axis: Axis) -> AxisFlags {
    axes(axis == Axis::X, axis == Axis::Y, axis == Axis::Z)
}
