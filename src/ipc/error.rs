use serde_json::json;

use crate::engine::EngineError;
use crate::store::StoreError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Error carried through a handler body until it is turned into a response.
#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Map a store failure onto the code for the kind of write that failed.
    pub fn store(code: &'static str, e: StoreError) -> Self {
        if matches!(e, StoreError::Db(_)) {
            Self::new(code, e.to_string())
        } else {
            Self::from(e)
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<StoreError> for HandlerErr {
    fn from(e: StoreError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<EngineError> for HandlerErr {
    fn from(e: EngineError) -> Self {
        let details = match &e {
            EngineError::NoActiveEnrollments { class_id } | EngineError::BatchInProgress { class_id } => {
                Some(json!({ "classId": class_id }))
            }
            EngineError::NoSubjects { school_id } => Some(json!({ "schoolId": school_id })),
            EngineError::Store(_) => None,
        };
        Self {
            code: e.code(),
            message: e.to_string(),
            details,
        }
    }
}
