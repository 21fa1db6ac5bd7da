//! Rendering of a [`ProcessReport`] for the terminal.

use keyward_core::{EntryOutcome, ProcessReport};
use serde_json::{json, Value};

use super::super::args::OutputArgs;

pub(crate) fn print(report: &ProcessReport, output: OutputArgs) -> anyhow::Result<i32> {
    if output.json {
        println!("{}", serde_json::to_string_pretty(&to_json(report))?);
    } else {
        for outcome in &report.outcomes {
            println!("{}", describe(outcome));
        }
        if let Some(attestation) = report.attestation {
            println!("attestation: {attestation}");
        }
    }
    Ok(report.exit_code())
}

fn describe(outcome: &EntryOutcome) -> String {
    match outcome {
        EntryOutcome::Enabled {
            index,
            kind,
            permission_id,
            persisted,
        } => {
            let note = if *persisted { "" } else { " (not persisted)" };
            format!("[{index}] enabled {kind} session {permission_id}{note}")
        }
        EntryOutcome::Executed {
            index,
            authorization,
        } => {
            let status = receipt_status(authorization.receipt.success);
            let tx = authorization
                .receipt
                .tx_hash
                .map(|h| format!(" tx {h}"))
                .unwrap_or_default();
            format!("[{index}] {status} operation {}{tx}", authorization.op_hash)
        }
        EntryOutcome::Skipped { index, error } => format!("[{index}] skipped: {error}"),
        EntryOutcome::Failed { index, error } => format!("[{index}] failed: {error}"),
    }
}

fn receipt_status(success: bool) -> &'static str {
    if success {
        "confirmed"
    } else {
        "reverted"
    }
}

pub(crate) fn to_json(report: &ProcessReport) -> Value {
    let entries: Vec<Value> = report
        .outcomes
        .iter()
        .map(|outcome| match outcome {
            EntryOutcome::Enabled {
                index,
                kind,
                permission_id,
                persisted,
            } => json!({
                "index": index,
                "status": "enabled",
                "kind": kind,
                "permissionId": permission_id,
                "persisted": persisted,
            }),
            EntryOutcome::Executed {
                index,
                authorization,
            } => json!({
                "index": index,
                "status": receipt_status(authorization.receipt.success),
                "opHash": authorization.op_hash,
                "txHash": authorization.receipt.tx_hash,
                "reason": authorization.receipt.reason,
                "recorded": authorization.recorded,
            }),
            EntryOutcome::Skipped { index, error } | EntryOutcome::Failed { index, error } => {
                let status = if matches!(outcome, EntryOutcome::Skipped { .. }) {
                    "skipped"
                } else {
                    "failed"
                };
                json!({
                    "index": index,
                    "status": status,
                    "error": error.to_string(),
                    "errorKind": error.kind(),
                    "ambiguous": error.is_ambiguous(),
                })
            }
        })
        .collect();

    json!({
        "entries": entries,
        "attestation": report.attestation,
        "exitCode": report.exit_code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_core::{AllowanceKind, KeywardError};

    #[test]
    fn test_json_report_shapes() {
        let report = ProcessReport {
            outcomes: vec![
                EntryOutcome::Enabled {
                    index: 0,
                    kind: AllowanceKind::Token,
                    permission_id: Default::default(),
                    persisted: true,
                },
                EntryOutcome::Skipped {
                    index: 1,
                    error: KeywardError::Classification {
                        index: 1,
                        reason: "unrecognized payload".to_string(),
                    },
                },
            ],
            attestation: None,
        };

        let value = to_json(&report);
        assert_eq!(value["entries"][0]["status"], "enabled");
        assert_eq!(value["entries"][0]["kind"], "token");
        assert_eq!(value["entries"][1]["status"], "skipped");
        assert_eq!(value["entries"][1]["errorKind"], "classification");
        assert_eq!(value["exitCode"], 2);
    }

    #[test]
    fn test_describe_blocked_destination() {
        let outcome = EntryOutcome::Failed {
            index: 3,
            error: KeywardError::DestinationBlocked {
                destination: Default::default(),
            },
        };
        let line = describe(&outcome);
        assert!(line.starts_with("[3] failed:"));
    }
}
