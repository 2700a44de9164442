use serde_json::Value;

use crate::repository::error::{RepositoryError, RepositoryResult};

/// Deep-merge `overlay` into `base`.
///
/// Objects merge member by member; any other value replaces what was there.
/// An object meeting a non-null non-object (either way round) cannot be
/// merged.
pub(crate) fn merge_into(base: &mut Value, overlay: Value, location: &str) -> RepositoryResult<()> {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let child = format!("{}/{}", location, key);
                match base.get_mut(&key) {
                    Some(existing) => merge_into(existing, value, &child)?,
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Ok(())
        }
        (base @ Value::Null, overlay) => {
            *base = overlay;
            Ok(())
        }
        (_, Value::Null) => Ok(()),
        (Value::Object(_), _) | (_, Value::Object(_)) => Err(RepositoryError::QueryExecution(format!(
            "cannot merge an object with a non-object value at {:?}",
            if location.is_empty() { "/" } else { location }
        ))),
        (base, overlay) => {
            *base = overlay;
            Ok(())
        }
    }
}
