use superplane::error::Error;
use superplane::service::duplicate_name;

/// Map a constraint we name in the schema to the domain error it means.
fn constraint_error(constraint: &str) -> Option<Error> {
    let err = match constraint {
        "organizations_name_key" => duplicate_name("organization"),
        "canvases_name_key" => duplicate_name("canvas"),
        "event_sources_name_key" => duplicate_name("event source"),
        "secrets_name_key" => duplicate_name("secret"),
        "stages_name_key" => duplicate_name("stage"),
        "stage_event_approvals_pkey" => {
            Error::Conflict("stage event already approved by this user".into())
        }
        "executions_one_active_per_stage" => {
            Error::Fatal("stage already has an active execution".into())
        }
        _ => return None,
    };
    Some(err)
}

pub(crate) fn db_error(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::RowNotFound => Error::NotFound("record not found".into()),
        sqlx::Error::Database(db) => {
            if let Some(mapped) = db.constraint().and_then(constraint_error) {
                return mapped;
            }
            if db.is_unique_violation() {
                Error::Conflict(db.message().to_string())
            } else if db.is_foreign_key_violation() {
                Error::NotFound(db.message().to_string())
            } else {
                Error::Transient(err.to_string())
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            Error::Fatal(err.to_string())
        }
        _ => Error::Transient(err.to_string()),
    }
}

/// `.db()` on sqlx results.
pub(crate) trait DbResultExt<T> {
    fn db(self) -> superplane::Result<T>;
}

impl<T> DbResultExt<T> for Result<T, sqlx::Error> {
    fn db(self) -> superplane::Result<T> {
        self.map_err(db_error)
    }
}
