//! Deal exports from the CRM (German column headers).

use super::{cell, extended_date, Transformed};
use crate::store::IndexSpec;
use crate::utils::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::io::Read;
use tracing::warn;

pub const DEFAULT_COLLECTION: &str = "deals";

pub const INDEXES: &[IndexSpec<'static>] = &[
    IndexSpec {
        field: "deal_id",
        unique: true,
        sparse: true,
    },
    IndexSpec {
        field: "status",
        unique: false,
        sparse: false,
    },
    IndexSpec {
        field: "owner",
        unique: false,
        sparse: false,
    },
    IndexSpec {
        field: "organization",
        unique: false,
        sparse: false,
    },
    IndexSpec {
        field: "created_date",
        unique: false,
        sparse: false,
    },
];

#[derive(Debug, Clone, Copy)]
enum Kind {
    Text,
    Number,
    Date,
}

const COLUMNS: &[(&str, &str, Kind)] = &[
    ("Deal - Titel", "title", Kind::Text),
    ("Deal - Organisation", "organization", Kind::Text),
    ("Deal - Wert", "value", Kind::Number),
    ("Deal - Status", "status", Kind::Text),
    ("Deal - Verlustgrund", "loss_reason", Kind::Text),
    ("Deal - Besitzer", "owner", Kind::Text),
    ("Deal - Deal erstellt", "created_date", Kind::Date),
    ("Deal - Datum des verlorenen Deals", "lost_date", Kind::Date),
    ("Deal - Phase", "phase", Kind::Text),
    ("Deal - Zu erledigende Aktivitäten", "pending_activities", Kind::Number),
    ("Deal - Kontaktperson", "contact_person", Kind::Text),
    ("Deal - Deal abgeschlossen am", "closed_date", Kind::Date),
    ("Deal - Erledigte Aktivitäten", "completed_activities", Kind::Number),
    ("Deal - Anzahl E-Mail-Nachrichten", "email_count", Kind::Number),
    ("Deal - ID", "deal_id", Kind::Text),
    ("Deal - Label", "label", Kind::Text),
    ("Deal - Datum der letzten Aktivität", "last_activity_date", Kind::Date),
    ("Deal - Letzte E-Mail erhalten", "last_email_received", Kind::Date),
    ("Deal - Letzte E-Mail gesendet", "last_email_sent", Kind::Date),
    ("Deal - Letzte Phasenänderung", "last_phase_change", Kind::Date),
    ("Deal - Datum nächste Aktivität", "next_activity_date", Kind::Date),
    ("Deal - Wahrscheinlichkeit", "probability", Kind::Number),
    ("Deal - Gesamtzahl der Aktivitäten", "total_activities", Kind::Number),
    ("Deal - Zeit der Aktualisierung", "last_update", Kind::Date),
    ("Deal - Sichtbar für", "visibility", Kind::Text),
    ("Deal - Gewichteter Wert", "weighted_value", Kind::Number),
    ("Deal - Pipeline", "pipeline", Kind::Text),
    ("Deal - Datum des gewonnenen Deals", "won_date", Kind::Date),
];

fn parse_number(raw: &str, warnings: &mut Vec<String>) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::Null;
    }
    match raw.parse::<f64>() {
        Ok(n) => Value::from(n),
        Err(_) => {
            warn!("Could not parse number '{}'", raw);
            warnings.push(format!("could not parse number '{raw}'"));
            Value::Null
        }
    }
}

fn parse_date(raw: &str, warnings: &mut Vec<String>) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::Null;
    }
    let parsed = if raw.contains(' ') {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()
    } else {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    };
    match parsed {
        Some(dt) => extended_date(dt),
        None => {
            warn!("Could not parse date '{}'", raw);
            warnings.push(format!("could not parse date '{raw}'"));
            Value::Null
        }
    }
}

/// Turn a deals CSV into documents. Rows repeating a `deal_id` seen earlier
/// in the file are skipped.
pub fn transform<R: Read>(reader: R, now: DateTime<Utc>) -> Result<Transformed> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers: Vec<String> = csv
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut out = Transformed::default();
    let missing: Vec<&str> = COLUMNS
        .iter()
        .map(|(header, _, _)| *header)
        .filter(|header| !headers.iter().any(|h| h == header))
        .collect();
    if !missing.is_empty() {
        warn!("Columns missing from deals export: {}", missing.join(", "));
        out.warnings
            .push(format!("missing columns treated as empty: {}", missing.join(", ")));
    }

    let mut seen = HashSet::new();
    for (line, record) in csv.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping unreadable row {}: {}", line + 2, e);
                out.warnings.push(format!("row {}: {}", line + 2, e));
                out.skipped += 1;
                continue;
            }
        };

        let mut doc = Map::new();
        for (header, field, kind) in COLUMNS {
            let raw = cell(&headers, &record, header);
            let value = match kind {
                Kind::Text => Value::from(raw),
                Kind::Number => parse_number(raw, &mut out.warnings),
                Kind::Date => parse_date(raw, &mut out.warnings),
            };
            doc.insert(field.to_string(), value);
        }

        let deal_id = cell(&headers, &record, "Deal - ID");
        if !deal_id.is_empty() && !seen.insert(deal_id.to_string()) {
            warn!("Deal with ID {} appears more than once, skipping", deal_id);
            out.skipped += 1;
            continue;
        }

        doc.insert("imported_at".into(), extended_date(now.naive_utc()));
        out.documents.push(Value::Object(doc));
    }
    Ok(out)
}

/// Deal id of a transformed document, if it has one.
pub fn deal_id(doc: &Value) -> Option<&str> {
    doc.get("deal_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}
