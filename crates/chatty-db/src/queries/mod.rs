mod chats;
mod messages;
mod users;

pub use users::{NewUser, OtpPurpose, ProfileChanges};

use anyhow::Result;
use rusqlite::types::ToSql;

/// `?1, ?2, ... ?n` for an `IN (...)` list.
pub(crate) fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn as_params(ids: &[String]) -> Vec<&dyn ToSql> {
    ids.iter().map(|id| id as &dyn ToSql).collect()
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::NewUser;
    use crate::Database;
    use crate::models::UserRow;
    use chrono::NaiveDate;

    pub fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    pub fn user(db: &Database, n: u32) -> UserRow {
        let id = format!("u{n}");
        db.create_user(&NewUser {
            id: id.clone(),
            username: format!("user{n}"),
            email: format!("user{n}@example.com"),
            contact: format!("98765432{n:02}"),
            name: format!("User {n}"),
            password_hash: "hash".into(),
            date_of_birth: NaiveDate::from_ymd_opt(2000, 1, 1),
        })
        .unwrap()
    }
}
