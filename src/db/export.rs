//! Spreadsheet export of a job's raw series.

use rust_xlsxwriter::{Format, Workbook};
use std::path::PathBuf;

use super::models::{Sample, SampleStatus};
use super::store::{export_file_name, Store, StoreError};

const RAW_HEADERS: [&str; 5] = ["timestamp", "target", "response_time", "status", "error"];

impl Store {
    /// Write `export_<job_id>.xlsx` with a `Raw Data` sheet and a
    /// `Statistics` sheet. Fails with `NotFound` when the job has no series.
    pub fn export_spreadsheet(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        let samples = self.load_samples(job_id)?;

        std::fs::create_dir_all(self.export_dir())?;
        let path = self.export_dir().join(export_file_name(job_id));

        let header = Format::new().set_bold();
        let mut workbook = Workbook::new();

        let raw = workbook.add_worksheet();
        raw.set_name("Raw Data")?;
        for (col, title) in RAW_HEADERS.iter().enumerate() {
            raw.write_string_with_format(0, col as u16, *title, &header)?;
        }
        for (i, s) in samples.iter().enumerate() {
            let row = i as u32 + 1;
            raw.write_string(row, 0, s.timestamp.to_rfc3339())?;
            raw.write_string(row, 1, s.target.as_str())?;
            if let Some(latency) = s.response_time() {
                raw.write_number(row, 2, latency)?;
            }
            raw.write_string(row, 3, s.status().as_str())?;
            if let Some(message) = s.error_message() {
                raw.write_string(row, 4, message)?;
            }
        }

        let stats = workbook.add_worksheet();
        stats.set_name("Statistics")?;
        stats.write_string_with_format(0, 0, "Metric", &header)?;
        stats.write_string_with_format(0, 1, "Value", &header)?;
        for (i, (metric, value)) in statistics_rows(&samples).into_iter().enumerate() {
            let row = i as u32 + 1;
            stats.write_string(row, 0, metric)?;
            stats.write_string(row, 1, value)?;
        }

        workbook.save(&path)?;
        tracing::info!("Exported {} samples for job {} to {}", samples.len(), job_id, path.display());
        Ok(path)
    }
}

fn statistics_rows(samples: &[Sample]) -> Vec<(&'static str, String)> {
    let total = samples.len();
    let count = |status: SampleStatus| samples.iter().filter(|s| s.status() == status).count();
    let successful = count(SampleStatus::Success);
    let availability = if total > 0 {
        successful as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    vec![
        ("Total Samples", total.to_string()),
        ("Successful Samples", successful.to_string()),
        ("Timeout Samples", count(SampleStatus::Timeout).to_string()),
        ("Availability", format!("{:.2}%", availability)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_statistics_rows() {
        let now = Utc::now();
        let samples = vec![
            Sample::success(now, "h", 1.0),
            Sample::success(now, "h", 2.0),
            Sample::timeout(now, "h"),
            Sample::error(now, "h", "x"),
        ];
        let rows = statistics_rows(&samples);
        assert_eq!(rows[0], ("Total Samples", "4".to_string()));
        assert_eq!(rows[1], ("Successful Samples", "2".to_string()));
        assert_eq!(rows[2], ("Timeout Samples", "1".to_string()));
        assert_eq!(rows[3], ("Availability", "50.00%".to_string()));
    }

    #[test]
    fn test_export_writes_workbook() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("t.db"), dir.path().join("exports")).unwrap();
        store
            .append_samples("job1", &[Sample::success(Utc::now(), "h", 3.0), Sample::timeout(Utc::now(), "h")])
            .unwrap();

        let path = store.export_spreadsheet("job1").unwrap();
        assert!(path.ends_with("export_job1.xlsx"));
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_export_unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("t.db"), dir.path().join("exports")).unwrap();
        assert!(matches!(store.export_spreadsheet("missing"), Err(StoreError::NotFound)));
    }
}
