//! Spreadsheet export of daily metric rows.

use rust_xlsxwriter::{Format, Workbook};
use secop_core::{DailyMetricRow, SourceId, DAILY_METRIC_COLUMNS};

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub fn export_sheet_name(source: SourceId) -> String {
    format!("{}_diario", source.slug().to_uppercase())
}

pub fn export_file_name(source: SourceId) -> String {
    format!("{}_metricas_diarias.xlsx", source.slug())
}

/// One sheet, header row first, one row per day. Dates are written as ISO text.
pub fn daily_metrics_xlsx(source: SourceId, rows: &[DailyMetricRow]) -> anyhow::Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();

    let sheet = workbook.add_worksheet();
    sheet.set_name(export_sheet_name(source))?;
    for (col, name) in DAILY_METRIC_COLUMNS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *name, &bold)?;
    }
    for (idx, row) in rows.iter().enumerate() {
        let r = idx as u32 + 1;
        sheet.write_string(r, 0, row.date.format("%Y-%m-%d").to_string())?;
        sheet.write_number(r, 1, row.contracts as f64)?;
        sheet.write_number(r, 2, row.sum_millions)?;
        sheet.write_number(r, 3, row.avg_millions)?;
        sheet.write_string(r, 4, row.source.as_str())?;
    }

    Ok(workbook.save_to_buffer()?)
}
