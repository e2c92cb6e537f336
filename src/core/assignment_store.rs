use std::io;
use std::path::Path;

/// One row of the assignment-store CSV (spec §4.3): UTF-8, comma-separated,
/// no quoting. `rate` is informational only — it is written for operators
/// but never trusted on load.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRow {
    pub metric: String,
    pub host: String,
    pub tcp_port: u16,
    pub rate: f64,
}

pub const HEADER: &str = "metric,host,tcpPort,rate";

/// Parse the assignment-store file at `path`. Skips the header row, drops
/// rows with fewer than 4 fields or an unparsable `tcpPort`, and never
/// propagates I/O failure — callers get whatever was accumulated before the
/// failure (spec: "log and return whatever was accumulated; do NOT
/// propagate").
pub fn read_rows(path: &Path) -> Vec<AssignmentRow> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("failed to read assignment store {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    let mut rows = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if i == 0 {
            continue; // header
        }
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 4 {
            log::debug!("dropping malformed assignment row: {}", line);
            continue;
        }
        let tcp_port: u16 = match fields[2].trim().parse() {
            Ok(port) => port,
            Err(_) => {
                log::debug!("dropping assignment row with unparsable port: {}", line);
                continue;
            }
        };
        let rate: f64 = fields[3].trim().parse().unwrap_or(0.0);
        rows.push(AssignmentRow {
            metric: fields[0].to_string(),
            host: fields[1].to_string(),
            tcp_port,
            rate,
        });
    }
    rows
}

/// Write the full assignment-store snapshot, header first, one row per
/// entry. The write is not incremental — a partial write on failure is not
/// recoverable (spec §6).
pub fn write_rows(path: &Path, rows: &[AssignmentRow]) -> io::Result<()> {
    let mut out = String::with_capacity(HEADER.len() + 1 + rows.len() * 32);
    out.push_str(HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&format!("{},{},{},{}\n", row.metric, row.host, row.tcp_port, row.rate));
    }
    std::fs::write(path, out)
}
