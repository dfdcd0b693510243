//! CSV export of the participant and data tables.

use cohort_core::{DataRecord, ParticipantRecord};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const PARTICIPANT_HEADER: &str = "id,worker_id,hit_id,assignment_id,platform,condition,\
created_at,start_time,end_time,status,data_id";

pub(crate) fn participants_csv(rows: &[ParticipantRecord]) -> Result<String, time::error::Format> {
    let mut csv = String::new();
    csv.push_str(PARTICIPANT_HEADER);
    csv.push('\n');
    for p in rows {
        let fields = [
            p.id.to_string(),
            p.worker_id.clone(),
            p.hit_id.clone().unwrap_or_default(),
            p.assignment_id.clone().unwrap_or_default(),
            p.platform.clone().unwrap_or_default(),
            p.condition.clone().unwrap_or_default(),
            timestamp(p.created_at)?,
            timestamp(p.start_time)?,
            p.end_time.map(timestamp).transpose()?.unwrap_or_default(),
            p.status.map(|s| s.to_string()).unwrap_or_default(),
            p.data_id.map(|id| id.to_string()).unwrap_or_default(),
        ];
        push_row(&mut csv, &fields);
    }
    Ok(csv)
}

pub(crate) fn data_csv(rows: &[DataRecord]) -> Result<String, serde_json::Error> {
    let mut csv = String::from("id,worker_id,condition,json_data\n");
    for d in rows {
        let fields = [
            d.id.to_string(),
            d.worker_id.clone().unwrap_or_default(),
            d.condition.clone().unwrap_or_default(),
            serde_json::to_string(&d.json_data)?,
        ];
        push_row(&mut csv, &fields);
    }
    Ok(csv)
}

/// One row per trial across all submissions. Columns are `worker_id`,
/// `condition`, then every trial key in first-seen order. Returns the CSV
/// and the number of trial rows.
pub(crate) fn trials_csv(rows: &[DataRecord]) -> Result<(String, usize), serde_json::Error> {
    let mut keys: Vec<&str> = Vec::new();
    for trial in rows.iter().flat_map(|d| &d.json_data) {
        for key in trial.keys() {
            if !keys.contains(&key.as_str()) {
                keys.push(key);
            }
        }
    }

    let mut header = vec!["worker_id".to_string(), "condition".to_string()];
    header.extend(keys.iter().map(|k| k.to_string()));
    let mut csv = String::new();
    push_row(&mut csv, &header);

    let mut count = 0;
    for d in rows {
        for trial in &d.json_data {
            let mut fields = vec![
                d.worker_id.clone().unwrap_or_default(),
                d.condition.clone().unwrap_or_default(),
            ];
            for key in &keys {
                fields.push(match trial.get(*key) {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => serde_json::to_string(other)?,
                });
            }
            push_row(&mut csv, &fields);
            count += 1;
        }
    }
    Ok((csv, count))
}

fn timestamp(t: OffsetDateTime) -> Result<String, time::error::Format> {
    t.format(&Rfc3339)
}

fn push_row(csv: &mut String, fields: &[String]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            csv.push(',');
        }
        csv.push_str(&escape(field));
    }
    csv.push('\n');
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use cohort_core::{NewParticipant, ParticipantStatus, TrialRecord};
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn trial(value: Value) -> TrialRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("trial must be an object"),
        }
    }

    #[test]
    fn escapes_separators_and_quotes() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn participant_rows_leave_missing_fields_empty() {
        let mut p = NewParticipant::started("w1");
        p.start_time = datetime!(2024-01-03 12:00 UTC);
        let rec = p.into_record(1, datetime!(2024-01-03 12:00 UTC));
        let csv = participants_csv(&[rec]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], PARTICIPANT_HEADER);
        assert_eq!(
            lines[1],
            "1,w1,,,,,2024-01-03T12:00:00Z,2024-01-03T12:00:00Z,,started,"
        );
        assert_eq!(ParticipantStatus::Started.to_string(), "started");
    }

    #[test]
    fn data_rows_embed_json() {
        let d = DataRecord {
            id: 3,
            worker_id: Some("w1".to_string()),
            condition: Some("trustworthy".to_string()),
            json_data: vec![trial(json!({"entry_1": "x"}))],
        };
        let csv = data_csv(&[d]).unwrap();
        assert_eq!(
            csv.lines().nth(1).unwrap(),
            "3,w1,trustworthy,\"[{\"\"entry_1\"\":\"\"x\"\"}]\""
        );
    }

    #[test]
    fn trials_take_union_of_keys() {
        let rows = vec![
            DataRecord {
                id: 1,
                worker_id: Some("w1".to_string()),
                condition: Some("happy".to_string()),
                json_data: vec![
                    trial(json!({"stimulus": "a.png", "rating": 4})),
                    trial(json!({"stimulus": "b.png", "rt": 812})),
                ],
            },
            DataRecord {
                id: 2,
                worker_id: None,
                condition: None,
                json_data: vec![trial(json!({"response": {"q0": "yes"}, "rating": null}))],
            },
        ];
        let (csv, count) = trials_csv(&rows).unwrap();
        assert_eq!(count, 3);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "worker_id,condition,stimulus,rating,rt,response");
        assert_eq!(lines[1], "w1,happy,a.png,4,,");
        assert_eq!(lines[2], "w1,happy,b.png,,812,");
        assert_eq!(lines[3], ",,,,,\"{\"\"q0\"\":\"\"yes\"\"}\"");
    }

    #[test]
    fn trial_columns_follow_submitted_key_order() {
        let submitted: Vec<TrialRecord> =
            serde_json::from_str(r#"[{"rt": 812, "stimulus": "a.png", "response": "b"}]"#).unwrap();
        let rows = vec![DataRecord {
            id: 1,
            worker_id: Some("w1".to_string()),
            condition: None,
            json_data: submitted,
        }];
        let (csv, _) = trials_csv(&rows).unwrap();
        assert_eq!(csv, "worker_id,condition,rt,stimulus,response\nw1,,812,a.png,b\n");
    }
}
