// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use crate::route_shapes::RouteShape;
use std::fmt::Write;

/// Renders route shapes as an aligned text table, one body row per route shape.
///
/// Columns are `Route_ID`, `Direction_ID`, `Longest_Shape_ID` (blank for union
/// geometries) and, when `verbose`, the WKT `Geometry` and `Centroid`.
pub fn render_table(route_shapes: &[RouteShape], verbose: bool) -> String {
    let mut header = vec!["Route_ID", "Direction_ID", "Longest_Shape_ID"];
    if verbose {
        header.extend(["Geometry", "Centroid"]);
    }

    let body: Vec<Vec<String>> = route_shapes
        .iter()
        .map(|route_shape| {
            let mut cells = vec![
                route_shape.route_id.to_string(),
                route_shape.direction_id.to_string(),
                route_shape
                    .shape_id
                    .map(|shape_id| shape_id.to_string())
                    .unwrap_or_default(),
            ];
            if verbose {
                cells.push(route_shape.geometry_wkt());
                cells.push(route_shape.centroid_wkt());
            }
            cells
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|title| title.len()).collect();
    for cells in &body {
        for (width, cell) in widths.iter_mut().zip(cells) {
            *width = (*width).max(cell.len());
        }
    }

    let mut table = String::new();
    write_row(&mut table, header.iter().copied(), &widths);
    for cells in &body {
        write_row(&mut table, cells.iter().map(String::as_str), &widths);
    }
    table
}

fn write_row<'a>(table: &mut String, cells: impl Iterator<Item = &'a str>, widths: &[usize]) {
    let line = cells
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = width))
        .collect::<Vec<String>>()
        .join(" | ");

    let _ = writeln!(table, "{}", line.trim_end());
}
