use crate::types::{Categories, TelemetryRecord};

/// Count detections in the detector output.
///
/// The detector writes one `<category>: <confidence>` line per detected
/// instance, mixed with other diagnostic output. A line counts toward a
/// category if it has a colon and the text before the first colon, once
/// trimmed, is exactly the category name. Anything else is ignored.
pub fn parse_detections(output: &str, categories: &Categories) -> TelemetryRecord {
    let mut record = TelemetryRecord::zeroed(categories);
    for line in output.lines() {
        if let Some((name, _)) = line.split_once(':') {
            record.count(name.trim());
        }
    }
    record
}
