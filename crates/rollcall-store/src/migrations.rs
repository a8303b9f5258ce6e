//! Schema migrations tracked in `PRAGMA user_version`.

use crate::StoreError;
use rusqlite::Connection;

/// Ordered migrations; entry `i` moves the schema from version `i` to `i + 1`.
const MIGRATIONS: &[&str] = &[
    include_str!("../migrations/0001_initial.sql"),
    include_str!("../migrations/0002_photo_digest.sql"),
];

pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

pub fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Apply every migration newer than the database's current version.
///
/// Each step runs in its own transaction together with the version bump.
pub fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let target = idx as i64 + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", target)?;
        tx.commit()?;
        tracing::info!(version = target, "applied schema migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{self, Namespace};

    #[test]
    fn test_migrate_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrade_from_v1_dedupes_people() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0]).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        conn.execute_batch(
            "INSERT INTO people VALUES (1, 'S1', 'Old', 'student', 'o', 'Org', 'u1');
             INSERT INTO people VALUES (2, 'S1', 'New', 'student', 'o', 'Org', 'u2');
             INSERT INTO people VALUES (3, 'S1', 'Teach', 'teacher', 'o', 'Org', 'u3');
             INSERT INTO kv_entries VALUES ('face_mapping', 'S1_student', 'number', '1');
             INSERT INTO kv_entries VALUES ('face_mapping', 'S1_teacher', 'number', '3');
             INSERT INTO kv_entries VALUES ('face_mapping', 'S7_student', 'number', '7');
             INSERT INTO kv_entries VALUES ('login', 'phone', 'text', '138');",
        )
        .unwrap();

        migrate(&mut conn).unwrap();

        let mapping = kv::list_keys(&conn, Namespace::FaceMapping).unwrap();
        assert_eq!(mapping, vec!["S1_student", "S1_teacher"]);
        let face = |key| {
            kv::get(&conn, Namespace::FaceMapping, key)
                .unwrap()
                .and_then(|v| v.as_i64())
        };
        assert_eq!(face("S1_student"), Some(2));
        assert_eq!(face("S1_teacher"), Some(3));
        assert!(kv::get(&conn, Namespace::Login, "phone").unwrap().is_some());

        let names: Vec<String> = conn
            .prepare("SELECT display_name FROM people ORDER BY face_id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(names, vec!["New".to_string(), "Teach".to_string()]);

        let dup = conn.execute(
            "INSERT INTO people
                 (face_id, external_id, display_name, role, org_id, org_name, source_image_url)
             VALUES (9, 'S1', 'Dup', 'student', 'o', 'Org', 'u')",
            [],
        );
        assert!(dup.is_err(), "unique (external_id, role) must be enforced");
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(
            migrate(&mut conn),
            Err(StoreError::UnsupportedSchemaVersion { .. })
        ));
    }
}
