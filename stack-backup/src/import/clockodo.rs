//! Time-tracking exports (monthly hours and revenue per customer and project).

use super::{cell, extended_date, Transformed};
use crate::utils::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use std::io::Read;
use tracing::warn;

pub const DEFAULT_COLLECTION: &str = "clockodo_data";

/// Parse a number with a decimal comma. Empty is zero.
fn german_number(raw: &str) -> Option<f64> {
    let raw = raw.trim().trim_matches('"');
    if raw.is_empty() {
        return Some(0.0);
    }
    raw.replace(',', ".").parse().ok()
}

/// First day of a `YYYY-MM` month.
fn month_start(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{}-01", raw.trim()), "%Y-%m-%d").ok()
}

fn text(raw: &str) -> Value {
    Value::from(raw.trim_matches('"'))
}

/// Turn a time-tracking CSV into documents. Rows with an unreadable number
/// are skipped.
pub fn transform<R: Read>(reader: R, now: DateTime<Utc>) -> Result<Transformed> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers: Vec<String> = csv
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut out = Transformed::default();
    for (line, record) in csv.records().enumerate() {
        let row = line + 2;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping unreadable row {}: {}", row, e);
                out.warnings.push(format!("row {row}: {e}"));
                out.skipped += 1;
                continue;
            }
        };
        let hours = german_number(cell(&headers, &record, "Stunden"));
        let revenue = german_number(cell(&headers, &record, "Umsatz in EUR"));
        let (Some(hours), Some(revenue)) = (hours, revenue) else {
            warn!("Skipping row {}: unreadable hours or revenue", row);
            out.warnings.push(format!("row {row}: unreadable hours or revenue"));
            out.skipped += 1;
            continue;
        };

        let month = cell(&headers, &record, "Monat");
        let mut doc = Map::new();
        doc.insert("kunde".into(), text(cell(&headers, &record, "Kunde")));
        doc.insert("projekt".into(), text(cell(&headers, &record, "Projekt")));
        doc.insert("monat".into(), Value::from(month));
        doc.insert(
            "monat_date".into(),
            month_start(month)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(extended_date)
                .unwrap_or(Value::Null),
        );
        doc.insert("leistung".into(), text(cell(&headers, &record, "Leistung")));
        doc.insert("mitarbeiter".into(), text(cell(&headers, &record, "Mitarbeiter")));
        doc.insert("stunden".into(), Value::from(hours));
        doc.insert("umsatz_eur".into(), Value::from(revenue));
        doc.insert("imported_at".into(), extended_date(now.naive_utc()));
        out.documents.push(Value::Object(doc));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_german_number() {
        assert_eq!(german_number("1234,5"), Some(1234.5));
        assert_eq!(german_number("\"7,25\""), Some(7.25));
        assert_eq!(german_number(""), Some(0.0));
        assert_eq!(german_number("n/a"), None);
    }

    #[test]
    fn test_month_start() {
        assert_eq!(month_start("2025-09"), NaiveDate::from_ymd_opt(2025, 9, 1));
        assert_eq!(month_start("September"), None);
    }

    #[test]
    fn test_transform_rows() {
        let data = "\
Kunde,Projekt,Monat,Leistung,Mitarbeiter,Stunden,Umsatz in EUR
\"Acme GmbH\",Relaunch,2025-09,Entwicklung,Erika Muster,\"12,5\",\"1250,00\"
Beta AG,Support,unbekannt,Beratung,Max Muster,,
Gamma,Audit,2025-08,Beratung,Max Muster,viel,10
";
        let out = transform(data.as_bytes(), now()).unwrap();
        assert_eq!(out.documents.len(), 2);
        assert_eq!(out.skipped, 1);

        let first = &out.documents[0];
        assert_eq!(first["kunde"], "Acme GmbH");
        assert_eq!(first["stunden"], json!(12.5));
        assert_eq!(first["umsatz_eur"], json!(1250.0));
        assert_eq!(first["monat"], "2025-09");
        assert_eq!(first["monat_date"], json!({ "$date": "2025-09-01T00:00:00.000Z" }));

        let second = &out.documents[1];
        assert_eq!(second["stunden"], json!(0.0));
        assert_eq!(second["monat_date"], Value::Null);
    }
}
