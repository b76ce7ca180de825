use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_core::AppError;

/// The shape an execution error takes once it crosses the backend boundary.
///
/// `serialize_error(deserialize_error(e))` must preserve `name` and
/// `message`; `stack` is best-effort and may be dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Serializes to the `{name, message, stack?}` JSON shape stored in a
    /// run or attempt's `error` column.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "name": "SerializationError", "message": self.message })
        })
    }

    /// Deserializes a stored `error` value back into a `SerializedError`,
    /// tolerating rows that only ever stored a bare string message.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        if let Ok(parsed) = serde_json::from_value::<Self>(value.clone()) {
            return parsed;
        }

        match value {
            Value::String(message) => Self::new("Error", message.clone()),
            other => Self::new("Error", other.to_string()),
        }
    }
}

impl From<&AppError> for SerializedError {
    fn from(error: &AppError) -> Self {
        let name = match error {
            AppError::Validation(_) => "ValidationError",
            AppError::NotFound(_) => "NotFoundError",
            AppError::Conflict(_) => "ConflictError",
            AppError::LeaseLost(_) => "LeaseLostError",
            AppError::BackendTransient(_) => "BackendTransientError",
            AppError::BackendFatal(_) => "BackendFatalError",
            AppError::StepFailed(_) => "StepError",
            AppError::DeterminismViolation(_) => "DeterminismViolationError",
            AppError::Internal(_) => "InternalError",
        };

        Self::new(name, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::SerializedError;

    #[test]
    fn round_trips_name_and_message() {
        let original = SerializedError {
            name: "TypeError".to_owned(),
            message: "cannot read property 'id'".to_owned(),
            stack: Some("at charge-card:12".to_owned()),
        };

        let value = original.to_value();
        let parsed = SerializedError::from_value(&value);

        assert_eq!(parsed.name, original.name);
        assert_eq!(parsed.message, original.message);
    }

    #[test]
    fn tolerates_bare_string_errors() {
        let value = json!("card declined");
        let parsed = SerializedError::from_value(&value);

        assert_eq!(parsed.name, "Error");
        assert_eq!(parsed.message, "card declined");
    }
}
