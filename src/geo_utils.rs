//! Geographic utilities: great-circle distance, path length and the WKT
//! encodings the storage collaborator expects.

use geo::{Coord, LineString, Polygon};

use crate::GpsPoint;

/// Mean Earth radius used for every distance in the tracker.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points in meters (haversine).
pub fn haversine_distance(a: &GpsPoint, b: &GpsPoint) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lng = (b.longitude - a.longitude).to_radians();
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Sum of haversine distances between consecutive points.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|pair| haversine_distance(&pair[0], &pair[1]))
        .sum()
}

/// Offset a point by a distance north and east, in meters.
///
/// Uses the local equirectangular approximation, which is accurate to well
/// under a meter for the few-hundred-meter offsets used when laying out loops.
pub fn offset_meters(origin: &GpsPoint, north_m: f64, east_m: f64) -> GpsPoint {
    let d_lat = (north_m / EARTH_RADIUS_M).to_degrees();
    let d_lng = (east_m / (EARTH_RADIUS_M * origin.latitude.to_radians().cos())).to_degrees();
    GpsPoint::new(origin.latitude + d_lat, origin.longitude + d_lng)
}

fn to_coord(p: &GpsPoint) -> Coord {
    Coord {
        x: p.longitude,
        y: p.latitude,
    }
}

fn format_coords<'a>(coords: impl Iterator<Item = &'a Coord>) -> String {
    coords
        .map(|c| format!("{} {}", c.x, c.y))
        .collect::<Vec<_>>()
        .join(",")
}

/// `POINT(lng lat)`.
pub fn point_wkt(p: &GpsPoint) -> String {
    format!("POINT({} {})", p.longitude, p.latitude)
}

/// `LINESTRING(lng lat,...)`, or `None` for an empty trail.
pub fn linestring_wkt(points: &[GpsPoint]) -> Option<String> {
    if points.is_empty() {
        return None;
    }
    let line: LineString = points.iter().map(to_coord).collect();
    Some(format!("LINESTRING({})", format_coords(line.coords())))
}

/// Build a closed polygon from a track.
///
/// Consecutive duplicates are dropped first. Returns `None` when fewer than
/// three distinct vertices remain, since no ring can be formed.
pub fn closed_polygon(points: &[GpsPoint]) -> Option<Polygon> {
    let mut coords: Vec<Coord> = Vec::with_capacity(points.len() + 1);
    for p in points {
        let c = to_coord(p);
        if coords.last() != Some(&c) {
            coords.push(c);
        }
    }
    // A track that returns exactly to its start would otherwise count the
    // start twice.
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }

    let mut distinct = coords.clone();
    distinct.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    distinct.dedup();
    if distinct.len() < 3 {
        return None;
    }

    // Polygon::new closes the exterior ring.
    Some(Polygon::new(LineString::new(coords), vec![]))
}

/// `MULTIPOLYGON(((lng lat,...,first)))` for a single closed ring.
pub fn multipolygon_wkt(polygon: &Polygon) -> String {
    format!(
        "MULTIPOLYGON((({})))",
        format_coords(polygon.exterior().coords())
    )
}

/// Prefix a WKT geometry with the WGS84 SRID.
pub fn ewkt(wkt: &str) -> String {
    format!("SRID=4326;{}", wkt)
}
