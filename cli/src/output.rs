//! Run summary printed after a successful flatten.

use monolayer_runtime::FlattenReport;

const SIZE_UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// Render a byte count with binary units, one decimal above 1 KiB.
pub fn human_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < SIZE_UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, SIZE_UNITS[unit])
}

/// Lines of the summary for `report`, in print order.
///
/// The last line is always the diff-id so it can be picked up by scripts.
pub fn summary_lines(report: &FlattenReport) -> Vec<String> {
    let mut lines = vec![
        format!("Found config: {}", report.source_config),
        format!(
            "Merged {} layer(s) into {} entries",
            report.layers, report.layer_entries
        ),
        format!(
            "Layer:  {} ({})",
            report.layer_path.display(),
            human_size(report.layer_size)
        ),
        format!("Config: {}", report.config_path.display()),
    ];

    if report.whiteouts > 0 {
        lines.push(format!("Whiteout markers kept as files: {}", report.whiteouts));
    }
    if report.skipped > 0 {
        lines.push(format!(
            "Entries skipped outside the image root: {}",
            report.skipped
        ));
    }

    lines.push(report.diff_id.clone());
    lines
}
