#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_termreportd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn termreportd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn send_line(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, line: &str) -> serde_json::Value {
    writeln!(stdin, "{}", line).expect("write request");
    stdin.flush().expect("flush request");

    let mut out = String::new();
    reader.read_line(&mut out).expect("read response line");
    assert!(!out.trim().is_empty(), "empty response for {}", line);
    serde_json::from_str(out.trim()).expect("parse response json")
}

/// Full response envelope.
pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    let value = send_line(stdin, reader, &payload.to_string());
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

/// `result` of a response that must have succeeded.
pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .cloned()
            .unwrap_or_else(|| json!({ "code": "unknown" }))
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Error code of a response that must have failed.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

pub const YEAR: &str = "2025";
pub const TERM: &str = "t1";

/// School `sch`, class `c1`, students `s1`/`s2` in batch `b1`, subjects
/// `math`/`eng`, bands A>=80 / B>=60 / F, and per subject one CA (`<subj>-ca`)
/// plus one end-of-term exam (`<subj>-exam`).
///
/// s1: Math 30+55, English 20+50. s2: Math 20+40, English 25+35.
pub fn seed_two_student_class(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let mut n = 0;
    let mut call = |method: &str, params: serde_json::Value| {
        n += 1;
        request_ok(stdin, reader, &format!("seed-{}", n), method, params)
    };

    call("schools.create", json!({ "schoolId": "sch", "name": "Test School" }));
    call("classes.create", json!({ "classId": "c1", "schoolId": "sch", "name": "Basic 6" }));
    for (id, first) in [("s1", "Ama"), ("s2", "Kofi")] {
        call(
            "students.create",
            json!({
                "studentId": id,
                "schoolId": "sch",
                "firstName": first,
                "lastName": "Mensah",
                "classId": "c1",
                "batchId": "b1"
            }),
        );
    }
    call("subjects.create", json!({ "subjectId": "math", "schoolId": "sch", "name": "Mathematics" }));
    call("subjects.create", json!({ "subjectId": "eng", "schoolId": "sch", "name": "English" }));
    call(
        "examTypes.create",
        json!({ "examTypeId": "eot", "schoolId": "sch", "name": "End of Term", "isSystem": true }),
    );
    call(
        "gradeBands.replace",
        json!({
            "schoolId": "sch",
            "bands": [
                { "gradeId": "g-a", "gradeName": "A", "minScore": 80, "maxScore": 100, "interpretation": "Excellent" },
                { "gradeId": "g-b", "gradeName": "B", "minScore": 60, "maxScore": 79.99, "interpretation": "Good" },
                { "gradeId": "g-f", "gradeName": "F", "minScore": 0, "maxScore": 59.99, "interpretation": "Fail" }
            ]
        }),
    );
    for subject in ["math", "eng"] {
        call(
            "assessments.create",
            json!({
                "assessmentId": format!("{}-ca", subject),
                "subjectId": subject,
                "classId": "c1",
                "academicYearId": YEAR,
                "academicTermId": TERM,
                "category": "continuous_assessment",
                "name": "Class work"
            }),
        );
        call(
            "assessments.create",
            json!({
                "assessmentId": format!("{}-exam", subject),
                "subjectId": subject,
                "classId": "c1",
                "academicYearId": YEAR,
                "academicTermId": TERM,
                "examTypeId": "eot",
                "name": "Paper"
            }),
        );
    }
    call(
        "results.upsert",
        json!({
            "entries": [
                { "assessmentId": "math-ca", "studentId": "s1", "convertedScore": 30 },
                { "assessmentId": "math-exam", "studentId": "s1", "convertedScore": 55 },
                { "assessmentId": "eng-ca", "studentId": "s1", "convertedScore": 20 },
                { "assessmentId": "eng-exam", "studentId": "s1", "convertedScore": 50 },
                { "assessmentId": "math-ca", "studentId": "s2", "convertedScore": 20 },
                { "assessmentId": "math-exam", "studentId": "s2", "convertedScore": 40 },
                { "assessmentId": "eng-ca", "studentId": "s2", "convertedScore": 25 },
                { "assessmentId": "eng-exam", "studentId": "s2", "convertedScore": 35 }
            ]
        }),
    );
}

pub fn run_batch_params() -> serde_json::Value {
    json!({
        "schoolId": "sch",
        "classId": "c1",
        "academicYearId": YEAR,
        "academicTermId": TERM
    })
}

pub fn period_params(key: &str, id: &str) -> serde_json::Value {
    json!({
        key: id,
        "academicYearId": YEAR,
        "academicTermId": TERM
    })
}
